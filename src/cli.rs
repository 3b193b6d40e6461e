use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "sshproxy",
    version,
    about = "SSH interception proxy with agent-based authentication"
)]
pub struct Cli {
    /// Path to configuration file (also settable via SSHPROXY_CONFIG env var)
    #[arg(short, long, default_value = "config.toml", env = "SSHPROXY_CONFIG")]
    pub config: PathBuf,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the proxy (default)
    Run,
    /// Validate configuration file
    CheckConfig,
    /// Generate an Ed25519 host key
    GenerateHostKey {
        /// Output file path
        #[arg(short, long, default_value = "host_key")]
        path: PathBuf,
        /// Replace an existing key file
        #[arg(long)]
        force: bool,
    },
}
