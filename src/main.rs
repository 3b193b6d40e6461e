use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use sshproxy::cli::{Cli, Command};
use sshproxy::config;
use sshproxy::config::types::AppConfig;

fn load(cli: &Cli) -> Result<AppConfig> {
    let mut cfg = config::load_config(&cli.config)?;
    config::env::apply_env_overrides(&mut cfg);
    config::validate_config(&cfg)?;
    Ok(cfg)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Command::CheckConfig) => {
            let cfg = load(&cli)?;
            println!("Configuration is valid.");
            println!("  Listen:          {}", cfg.server.listen);
            println!("  Host key:        {}", cfg.server.host_key_path.display());
            println!("  Agent required:  {}", cfg.auth.agent_forwarding);
            println!("  Authorized keys: {}", cfg.auth.authorized_keys.len());
            match &cfg.session.ciphers {
                Some(ciphers) => println!("  Ciphers:         {}", ciphers.join(",")),
                None => println!("  Ciphers:         (backend defaults)"),
            }
            return Ok(());
        }
        Some(Command::GenerateHostKey { path, force }) => {
            let key = sshproxy::ssh::keys::generate_host_key_file(path, *force)?;
            println!("Host key written to {}", path.display());
            println!(
                "Fingerprint: {}",
                sshproxy::ssh::interface::key_fingerprint(key.public_key())
            );
            return Ok(());
        }
        Some(Command::Run) | None => {}
    }

    let app_config = load(&cli)?;

    // CLI override > config
    let log_level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| app_config.logging.level.to_string());
    sshproxy::logging::setup_logging(&log_level, app_config.logging.format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %app_config.server.listen,
        "Starting sshproxy"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        if let Err(e) = sshproxy::server::run(app_config).await {
            error!(error = %e, "Server error");
            std::process::exit(1);
        }
    });

    Ok(())
}
