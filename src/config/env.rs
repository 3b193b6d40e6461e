//! Environment variable overrides applied on top of the config file.

use crate::config::types::*;
use std::path::PathBuf;

pub fn apply_env_overrides(config: &mut AppConfig) {
    if let Some(v) = opt_env("SSHPROXY_LISTEN") {
        config.server.listen = v;
    }
    if let Some(v) = opt_env("SSHPROXY_HOST_KEY_PATH") {
        config.server.host_key_path = PathBuf::from(v);
    }

    let ciphers = parse_csv_env("SSHPROXY_CIPHERS");
    if !ciphers.is_empty() {
        config.session.ciphers = Some(ciphers);
    }

    if std::env::var("SSHPROXY_AGENT_FORWARDING").is_ok() {
        config.auth.agent_forwarding =
            parse_bool_env("SSHPROXY_AGENT_FORWARDING", config.auth.agent_forwarding);
    }

    if let Some(v) = opt_env("SSHPROXY_LOG_LEVEL") {
        match parse_log_level(&v) {
            Ok(level) => config.logging.level = level,
            Err(e) => tracing::warn!(error = %e, "Ignoring SSHPROXY_LOG_LEVEL"),
        }
    }
    if let Some(v) = opt_env("SSHPROXY_LOG_FORMAT") {
        match parse_log_format(&v) {
            Ok(format) => config.logging.format = format,
            Err(e) => tracing::warn!(error = %e, "Ignoring SSHPROXY_LOG_FORMAT"),
        }
    }
}

fn opt_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse_bool_env(key: &str, default: bool) -> bool {
    opt_env(key)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

fn parse_csv_env(key: &str) -> Vec<String> {
    opt_env(key)
        .map(|s| {
            s.split(',')
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

pub fn parse_log_level(s: &str) -> anyhow::Result<LogLevel> {
    match s.to_ascii_lowercase().as_str() {
        "trace" => Ok(LogLevel::Trace),
        "debug" => Ok(LogLevel::Debug),
        "info" => Ok(LogLevel::Info),
        "warn" => Ok(LogLevel::Warn),
        "error" => Ok(LogLevel::Error),
        _ => anyhow::bail!("invalid log level: '{s}'"),
    }
}

pub fn parse_log_format(s: &str) -> anyhow::Result<LogFormat> {
    match s.to_ascii_lowercase().as_str() {
        "pretty" => Ok(LogFormat::Pretty),
        "json" => Ok(LogFormat::Json),
        _ => anyhow::bail!("invalid log format: '{s}'"),
    }
}
