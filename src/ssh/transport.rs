//! Seams between the session lifecycle and the SSH engine.
//!
//! The session only ever talks to these traits; `ssh::backend` implements them on
//! top of russh and the tests implement them with in-memory mocks.

use crate::error::{ConfigurationError, TransportError};
use crate::ssh::agent::AgentBridge;
use crate::ssh::cipher::CipherSuite;
use crate::ssh::event::OneShotEvent;
use crate::ssh::interface::ServerInterface;
use crate::ssh::registry::ChannelRegistry;
use async_trait::async_trait;
use russh::keys::PrivateKey;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub type ChannelHandle = Arc<dyn Channel>;

/// One multiplexed stream inside a transport.
#[async_trait]
pub trait Channel: Send + Sync + fmt::Debug {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Server side of one SSH connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Restrict negotiation to `ciphers`, in order.
    fn set_ciphers(&mut self, ciphers: &CipherSuite) -> Result<(), ConfigurationError>;

    fn add_server_key(&mut self, key: PrivateKey);

    fn set_subsystem_handler(&mut self, name: &str, handler: Arc<dyn SubsystemHandler>);

    /// Start serving. `completion` fires once authentication completes or the
    /// transport terminates, whichever comes first.
    fn start_server(
        &mut self,
        completion: OneShotEvent,
        server: Arc<dyn ServerInterface>,
    ) -> Result<(), TransportError>;

    /// Wait up to `timeout` for the next channel ready for service.
    async fn accept(&mut self, timeout: Duration) -> Option<ChannelHandle>;

    fn is_active(&self) -> bool;

    fn close(&mut self);

    /// A bridge for the client's forwarded agent, or `None` when the client never
    /// asked to forward one.
    fn agent_bridge(&self) -> Option<Box<dyn AgentBridge>>;
}

/// Deferred transport construction; consumed the first time the session needs it.
pub trait TransportFactory: Send + Sync {
    fn build(self: Box<Self>) -> Box<dyn Transport>;
}

/// Handler for a named subsystem (e.g. `sftp`) requested on a channel.
pub trait SubsystemHandler: Send + Sync {
    /// Take ownership of `channel` for the subsystem. Returns whether the request
    /// is accepted.
    fn start(&self, name: &str, channel: ChannelHandle, registry: &ChannelRegistry) -> bool;
}
