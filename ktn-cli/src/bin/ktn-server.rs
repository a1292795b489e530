//! KTN Server - echo server
//!
//! Accepts connections and echoes every received line back to the client
//! until the client closes, or until `--close-after` lines were echoed.

use anyhow::Context;
use clap::Parser;
use ktn::{ConnectionError, Stack};
use ktn_cli::{display_connection_stats, serve, Config};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "ktn-server")]
#[command(about = "KTN echo server", long_about = None)]
struct Args {
    /// Local address to listen on
    #[arg(short, long, default_value = "127.0.0.1:8002")]
    bind: SocketAddr,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serve a single connection, then exit
    #[arg(long)]
    once: bool,

    /// Close each connection after echoing this many lines
    #[arg(long)]
    close_after: Option<usize>,

    /// Override the simulated loss probability
    #[arg(long)]
    loss: Option<f64>,

    /// Override the simulated network RNG seed
    #[arg(long)]
    seed: Option<u64>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    ktn_cli::init_logging(args.verbose);

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(loss) = args.loss {
        config.network.loss_probability = loss;
    }
    if args.seed.is_some() {
        config.network.seed = args.seed;
    }
    config.validate()?;

    let stack = Stack::new(config.protocol.to_protocol_config())
        .with_failures(config.network.to_failure_config());
    let mut listener = stack
        .bind(args.bind)
        .with_context(|| format!("failed to bind {}", args.bind))?;

    tracing::info!("KTN server listening on {}", listener.local_endpoint());

    loop {
        let mut connection = match listener.accept() {
            Ok(connection) => connection,
            Err(e @ ConnectionError::Timeout(_)) => {
                tracing::warn!("Handshake failed: {}", e);
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        match serve(&mut connection, args.close_after) {
            Ok(echoed) => tracing::info!(
                "Served {} lines: {}",
                echoed,
                display_connection_stats(&connection.stats())
            ),
            Err(e) => tracing::error!("Connection failed: {}", e),
        }
        if args.once {
            break;
        }
    }

    listener.close()?;
    Ok(())
}
