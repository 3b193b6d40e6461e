use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Log level enum (replaces stringly-typed field)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Pretty => f.write_str("pretty"),
            LogFormat::Json => f.write_str("json"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub listen: String,
    #[serde(default = "default_host_key_path")]
    pub host_key_path: PathBuf,
    #[serde(default = "default_server_id")]
    pub server_id: String,
    /// Seconds to wait for active sessions to finish after a shutdown signal.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
    /// SSH keepalive interval in seconds (0 = disabled).
    #[serde(default = "default_ssh_keepalive_interval_secs")]
    pub ssh_keepalive_interval_secs: u64,
    /// Unanswered keepalives before the client is disconnected.
    #[serde(default = "default_ssh_keepalive_max")]
    pub ssh_keepalive_max: u32,
    /// Delay before answering a rejected authentication attempt.
    #[serde(default = "default_auth_rejection_time_ms")]
    pub auth_rejection_time_ms: u64,
}

fn default_host_key_path() -> PathBuf {
    PathBuf::from("host_key")
}

fn default_server_id() -> String {
    "SSH-2.0-sshproxy".to_string()
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_ssh_keepalive_interval_secs() -> u64 {
    15
}

fn default_ssh_keepalive_max() -> u32 {
    3
}

fn default_auth_rejection_time_ms() -> u64 {
    1000
}

/// Per-session lifecycle tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Fixed cipher list, in preference order. Unset keeps the backend defaults.
    #[serde(default)]
    pub ciphers: Option<Vec<String>>,
    #[serde(default = "default_accept_poll_interval_ms")]
    pub accept_poll_interval_ms: u64,
    /// 0 waits for authentication without a bound.
    #[serde(default)]
    pub auth_timeout_secs: u64,
    #[serde(default = "default_agent_connect_timeout_ms")]
    pub agent_connect_timeout_ms: u64,
}

impl SessionConfig {
    pub fn accept_poll_interval(&self) -> Duration {
        Duration::from_millis(self.accept_poll_interval_ms)
    }

    pub fn auth_timeout(&self) -> Option<Duration> {
        (self.auth_timeout_secs > 0).then(|| Duration::from_secs(self.auth_timeout_secs))
    }

    pub fn agent_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_connect_timeout_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ciphers: None,
            accept_poll_interval_ms: default_accept_poll_interval_ms(),
            auth_timeout_secs: 0,
            agent_connect_timeout_ms: default_agent_connect_timeout_ms(),
        }
    }
}

fn default_accept_poll_interval_ms() -> u64 {
    500
}

fn default_agent_connect_timeout_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    /// Require the client to forward its agent before the session may proceed.
    #[serde(default = "default_true")]
    pub agent_forwarding: bool,
    /// OpenSSH `authorized_keys` lines accepted by the default authenticator.
    #[serde(default)]
    pub authorized_keys: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            agent_forwarding: true,
            authorized_keys: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}
