//! KTN Client - echo client
//!
//! Connects to a KTN server, sends each line and prints the echoes. Then it
//! either closes or, with `--wait-eos`, waits for the server to close.

use anyhow::Context;
use clap::Parser;
use ktn::Stack;
use ktn_cli::{display_connection_stats, run_client, ClientFinish, Config};
use std::net::SocketAddr;
use std::path::PathBuf;

const DEFAULT_LINES: [&str; 4] = ["Line one", "Line two", "Line three", "Line four"];

#[derive(Parser, Debug)]
#[command(name = "ktn-client")]
#[command(about = "KTN echo client", long_about = None)]
struct Args {
    /// Local address to bind
    #[arg(short, long, default_value = "127.0.0.1:8001")]
    bind: SocketAddr,

    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:8002")]
    server: SocketAddr,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the simulated loss probability
    #[arg(long)]
    loss: Option<f64>,

    /// Override the simulated network RNG seed
    #[arg(long)]
    seed: Option<u64>,

    /// Wait for the server to close instead of closing after the last echo
    #[arg(long)]
    wait_eos: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Lines to send
    lines: Vec<String>,
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

    let lines: Vec<String> = if args.lines.is_empty() {
        DEFAULT_LINES.iter().map(|line| line.to_string()).collect()
    } else {
        args.lines
    };

    let stack = Stack::new(config.protocol.to_protocol_config())
        .with_failures(config.network.to_failure_config());
    let mut connection = stack
        .bind(args.bind)
        .with_context(|| format!("failed to bind {}", args.bind))?;

    connection
        .connect(args.server)
        .with_context(|| format!("failed to connect to {}", args.server))?;
    tracing::info!("Connected to {}", args.server);

    let finish = if args.wait_eos {
        ClientFinish::AwaitEndOfStream
    } else {
        ClientFinish::Close
    };
    let (echoes, stats) = run_client(&mut connection, &lines, finish)?;
    for echo in &echoes {
        println!("{}", echo);
    }
    tracing::info!("Closed: {}", display_connection_stats(&stats));
    Ok(())
}
