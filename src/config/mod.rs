pub mod env;
pub mod types;

use crate::error::ConfigurationError;
use crate::ssh::cipher::CipherSuite;
use anyhow::{Context, Result};
use std::path::Path;
use types::AppConfig;

/// Maximum config file size (1 MB)
const MAX_CONFIG_SIZE: u64 = 1_048_576;

/// Load and validate configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("reading config metadata: {}", path.display()))?;
    if metadata.len() > MAX_CONFIG_SIZE {
        anyhow::bail!(
            "config file too large: {} bytes (max {} bytes)",
            metadata.len(),
            MAX_CONFIG_SIZE
        );
    }

    check_config_file_permissions(path);

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading config: {}", path.display()))?;
    parse_config(&content)
}

/// Warn if the config file is readable by group or others; it lists the keys
/// allowed through the proxy.
#[cfg(unix)]
fn check_config_file_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    match std::fs::metadata(path) {
        Ok(meta) => {
            let mode = meta.permissions().mode();
            if mode & 0o077 != 0 {
                tracing::warn!(
                    path = %path.display(),
                    mode = format!("{:04o}", mode & 0o7777),
                    "Config file is readable by group/others. \
                     Consider restricting permissions to 0600."
                );
            }
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Could not check config file permissions"
            );
        }
    }
}

#[cfg(not(unix))]
fn check_config_file_permissions(_path: &Path) {}

/// Parse configuration from a TOML string
pub fn parse_config(content: &str) -> Result<AppConfig> {
    let config: AppConfig = toml::from_str(content).context("parsing TOML configuration")?;
    validate_config(&config)?;
    Ok(config)
}

/// Validate a config after environment overrides were applied.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    validate_server(config)?;
    validate_session(config)?;
    validate_auth(config)?;
    Ok(())
}

fn validate_server(config: &AppConfig) -> Result<()> {
    if config.server.listen.is_empty() {
        anyhow::bail!("server.listen must not be empty");
    }
    if !config.server.server_id.starts_with("SSH-2.0-") {
        anyhow::bail!(
            "server.server_id must start with 'SSH-2.0-' (got '{}')",
            config.server.server_id
        );
    }
    Ok(())
}

fn validate_session(config: &AppConfig) -> Result<()> {
    if config.session.accept_poll_interval_ms == 0 {
        anyhow::bail!("session.accept_poll_interval_ms must be > 0");
    }
    if config.session.agent_connect_timeout_ms == 0 {
        anyhow::bail!("session.agent_connect_timeout_ms must be > 0");
    }
    cipher_suite(config).context("session.ciphers")?;
    Ok(())
}

fn validate_auth(config: &AppConfig) -> Result<()> {
    for (i, line) in config.auth.authorized_keys.iter().enumerate() {
        crate::auth::pubkey::parse_authorized_key(line)
            .with_context(|| format!("auth.authorized_keys[{i}]"))?;
    }
    if config.auth.authorized_keys.is_empty() {
        tracing::warn!("auth.authorized_keys is empty: every session will be rejected");
    }
    Ok(())
}

/// The configured cipher override, validated against the russh backend.
pub fn cipher_suite(config: &AppConfig) -> Result<Option<CipherSuite>, ConfigurationError> {
    let Some(names) = &config.session.ciphers else {
        return Ok(None);
    };
    let suite = CipherSuite::new(names.iter().cloned())?;
    if let Some(name) = suite.first_unsupported() {
        return Err(ConfigurationError::UnsupportedCipher(name.to_string()));
    }
    Ok(Some(suite))
}
