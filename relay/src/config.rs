use clap::Parser;
use std::path::PathBuf;

/// Command line configuration for the relay binary.
#[derive(Parser, Debug, Clone)]
#[command(name = "synclog-relay")]
#[command(about = "Durable sync relay for synclog clients")]
pub struct RelayConfig {
    /// HTTP port to listen on
    #[arg(short, long, default_value = "4010")]
    pub port: u16,

    /// Directory for actor state and per-identity journals. Omit to keep
    /// everything in memory.
    #[arg(short, long)]
    pub state: Option<PathBuf>,

    /// Upstream sync service (`host:port`) holding the identities' logs.
    /// Takes precedence over local journals.
    #[arg(long, value_name = "ADDR")]
    pub backend: Option<String>,

    /// Also serve this relay's backends to other relays on `ADDR`.
    #[arg(long, value_name = "ADDR")]
    pub backend_listen: Option<String>,

    /// Shared secret clients derive their tokens from
    #[arg(long)]
    pub secret: String,

    /// Enable verbose debug logging
    #[arg(short, long)]
    pub verbose: bool,
}
