use std::time::Duration;
use thiserror::Error;

/// Invalid cipher override or other malformed session configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("cipher list must not be empty")]
    EmptyCipherList,
    #[error("cipher list contains a blank entry")]
    BlankCipher,
    #[error("cipher '{0}' listed more than once")]
    DuplicateCipher(String),
    #[error("unsupported cipher: {0}")]
    UnsupportedCipher(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport already started")]
    AlreadyStarted,
    #[error("transport not started")]
    NotStarted,
    #[error("channel closed")]
    ChannelClosed,
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("client refused the agent channel: {0}")]
    ChannelRefused(String),
    #[error("agent bridge setup timed out after {0:?}")]
    Timeout(Duration),
    #[error("agent socket: {0}")]
    Io(#[from] std::io::Error),
    #[error("agent forwarding is not supported on this platform")]
    Unsupported,
}

/// Why `Session::start` did not reach the active state.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("no channel opened before shutdown")]
    ChannelAccept,
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("agent forwarding failed: {0}")]
    AgentForwarding(#[source] AgentError),
    #[error("no ssh agent forwarded")]
    AgentForwardingDeclined,
    #[error("client requested no usable service")]
    UnresolvedService,
    #[error("session already started")]
    AlreadyStarted,
}

impl SessionError {
    /// Short label used in logs and the terminal state.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Configuration(_) => "configuration",
            SessionError::Transport(_) => "transport",
            SessionError::ChannelAccept => "channel_accept",
            SessionError::Authentication(_) => "authentication",
            SessionError::AgentForwarding(_) => "agent_forwarding",
            SessionError::AgentForwardingDeclined => "agent_declined",
            SessionError::UnresolvedService => "unresolved_service",
            SessionError::AlreadyStarted => "already_started",
        }
    }
}
