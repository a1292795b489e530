//! KTN CLI Library
//!
//! Shared functionality for KTN command-line tools.

pub mod config;
pub mod session;
pub mod stats;

pub use config::{Config, ConfigError, NetworkSection, ProtocolSection};
pub use session::{run_client, serve, ClientFinish};
pub use stats::{display_connection_stats, format_bytes};

/// Install the `tracing` subscriber, honouring `RUST_LOG` (default `info`)
pub fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
