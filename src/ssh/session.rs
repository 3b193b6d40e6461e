//! Per-connection session lifecycle.
//!
//! A [`Session`] owns the transport built from one accepted socket, the optional
//! agent bridge, and (through its [`SessionContext`]) the channel registry. It is
//! constructed by the proxy server, driven once through [`Session::start`], and
//! released by [`Session::close`] (or by dropping it).

use crate::auth::{AuthContext, AuthResult, Authenticator};
use crate::error::{SessionError, TransportError};
use crate::server::ProxyServer;
use crate::ssh::agent::{self, AgentBridge};
use crate::ssh::context::SessionContext;
use crate::ssh::event::OneShotEvent;
use crate::ssh::transport::{ChannelHandle, Transport, TransportFactory};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Sent on the main channel when the client did not forward an agent.
pub const NO_AGENT_MESSAGE: &str = "Kein SSH Agent weitergeleitet\r\n";

/// Sent on the main channel when the authenticator rejects the session.
pub const PERMISSION_DENIED_MESSAGE: &str = "Permission denied (publickey).\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    ServerStarted,
    AwaitingChannel,
    ChannelFailed,
    AwaitingAuth,
    AuthFailed,
    AwaitingAgent,
    AgentFailed,
    AgentDeclined,
    AuthRejected,
    ServiceUnresolved,
    Active,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Created => "created",
            SessionState::ServerStarted => "server_started",
            SessionState::AwaitingChannel => "awaiting_channel",
            SessionState::ChannelFailed => "channel_failed",
            SessionState::AwaitingAuth => "awaiting_auth",
            SessionState::AuthFailed => "auth_failed",
            SessionState::AwaitingAgent => "awaiting_agent",
            SessionState::AgentFailed => "agent_failed",
            SessionState::AgentDeclined => "agent_declined",
            SessionState::AuthRejected => "auth_rejected",
            SessionState::ServiceUnresolved => "service_unresolved",
            SessionState::Active => "active",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

pub struct Session {
    context: Arc<SessionContext>,
    proxy: Arc<ProxyServer>,
    pending: Option<Box<dyn TransportFactory>>,
    transport: Option<Box<dyn Transport>>,
    channel: Option<ChannelHandle>,
    agent: Option<Box<dyn AgentBridge>>,
    authenticator: Box<dyn Authenticator>,
    state: SessionState,
    closed: bool,
}

impl Session {
    pub fn new(
        proxy: Arc<ProxyServer>,
        connection: Box<dyn TransportFactory>,
        client_address: SocketAddr,
        socket_remote_address: SocketAddr,
    ) -> Self {
        Self::with_conn_id(
            proxy,
            connection,
            crate::utils::generate_correlation_id(),
            client_address,
            socket_remote_address,
        )
    }

    /// Like [`Session::new`], reusing the correlation id of the connection span.
    pub fn with_conn_id(
        proxy: Arc<ProxyServer>,
        connection: Box<dyn TransportFactory>,
        conn_id: String,
        client_address: SocketAddr,
        socket_remote_address: SocketAddr,
    ) -> Self {
        let context = Arc::new(SessionContext::new(
            conn_id,
            client_address,
            socket_remote_address,
            proxy.shutdown_token().child_token(),
        ));
        let authenticator = proxy.new_authenticator();
        Self {
            context,
            proxy,
            pending: Some(connection),
            transport: None,
            channel: None,
            agent: None,
            authenticator,
            state: SessionState::Created,
            closed: false,
        }
    }

    pub fn name(&self) -> &str {
        self.context.name()
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.context
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn channel(&self) -> Option<&ChannelHandle> {
        self.channel.as_ref()
    }

    pub fn agent(&self) -> Option<&dyn AgentBridge> {
        self.agent.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether the proxy still runs and nobody asked this session to stop.
    pub fn running(&self) -> bool {
        self.proxy.running() && !self.context.is_cancelled()
    }

    pub fn transport_active(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| t.is_active())
    }

    /// Build the transport on first use and configure it for serving.
    pub fn ensure_transport(&mut self) -> Result<&mut Box<dyn Transport>, SessionError> {
        if self.transport.is_none() {
            let factory = self.pending.take().ok_or(TransportError::NotStarted)?;
            let mut transport = factory.build();
            if let Some(ciphers) = &self.proxy.settings().ciphers {
                transport.set_ciphers(ciphers)?;
                debug!(session = %self, ciphers = %ciphers, "cipher override applied");
            }
            transport.add_server_key(self.proxy.host_key().clone());
            transport.set_subsystem_handler("sftp", self.proxy.sftp_interface());
            self.transport = Some(transport);
        }
        self.transport
            .as_mut()
            .ok_or(SessionError::Transport(TransportError::NotStarted))
    }

    /// Drive the session from handshake to an active, resolved service.
    ///
    /// Every expected failure is handled here (partial cleanup, a message to the
    /// client where appropriate) and reported as an `Err`; afterwards `close()`
    /// is always safe to call.
    pub async fn start(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Created {
            return Err(SessionError::AlreadyStarted);
        }

        let completion = OneShotEvent::new();
        let server = self.proxy.authentication_interface(self.context.clone());
        self.ensure_transport()?
            .start_server(completion.clone(), server)?;
        self.state = SessionState::ServerStarted;

        self.state = SessionState::AwaitingChannel;
        let Some(channel) = self.accept_channel().await else {
            self.state = SessionState::ChannelFailed;
            error!(session = %self, "session error opening channel!");
            return Err(SessionError::ChannelAccept);
        };
        self.channel = Some(channel);

        self.state = SessionState::AwaitingAuth;
        if !self.wait_for_authentication(&completion).await {
            self.state = SessionState::AuthFailed;
            return Err(SessionError::Authentication(
                "transport closed before authentication completed".to_string(),
            ));
        }

        self.start_channels().await?;

        self.state = SessionState::Active;
        info!(session = %self, "session started");
        Ok(())
    }

    /// Poll the transport for a channel until one arrives or the proxy stops.
    async fn accept_channel(&mut self) -> Option<ChannelHandle> {
        let interval = self.proxy.settings().accept_poll_interval;
        loop {
            let transport = self.transport.as_mut()?;
            let channel = transport.accept(interval).await;
            if !(self.proxy.running() && !self.context.is_cancelled()) {
                let transport = self.transport.as_mut()?;
                if transport.is_active() {
                    transport.close();
                }
                debug!(session = %self, "shutdown requested while waiting for a channel");
                return None;
            }
            if channel.is_some() {
                return channel;
            }
            if !self.transport_active() {
                debug!(session = %self, "transport terminated before opening a channel");
                return None;
            }
        }
    }

    /// Wait for the authentication-completion event. Returns whether the session
    /// may proceed.
    async fn wait_for_authentication(&mut self, completion: &OneShotEvent) -> bool {
        let fired = match self.proxy.settings().auth_timeout {
            Some(limit) => tokio::select! {
                fired = completion.wait_timeout(limit) => {
                    if !fired {
                        warn!(session = %self, timeout = ?limit, "authentication timed out");
                    }
                    fired
                }
                _ = self.context.cancelled() => false,
            },
            None => tokio::select! {
                _ = completion.wait() => true,
                _ = self.context.cancelled() => false,
            },
        };
        if !fired {
            if let Some(transport) = self.transport.as_mut() {
                if transport.is_active() {
                    transport.close();
                }
            }
            return false;
        }
        self.transport_active()
    }

    /// Resolve agent forwarding, delegated authentication and the service kind.
    async fn start_channels(&mut self) -> Result<(), SessionError> {
        if self.context.registry().has_client() {
            self.context.registry().mark_ready();
            return Ok(());
        }

        self.state = SessionState::AwaitingAgent;
        if self.agent.is_none() && self.authenticator.agent_forwarding_requested() {
            if let Err(e) = self.connect_agent().await {
                warn!(session = %self, error = %e, "agent forwarding failed");
                self.state = SessionState::AgentFailed;
                self.close();
                return Err(SessionError::AgentForwarding(e));
            }
        }

        if self.agent.is_none() {
            self.state = SessionState::AgentDeclined;
            warn!(session = %self, "session rejected: no ssh agent forwarded");
            self.send_notice(NO_AGENT_MESSAGE).await;
            return Err(SessionError::AgentForwardingDeclined);
        }

        let result = self
            .authenticator
            .authenticate(AuthContext {
                session: &self.context,
                agent: self.agent.as_deref(),
            })
            .await;
        if result != AuthResult::Success {
            self.state = SessionState::AuthRejected;
            warn!(session = %self, "session rejected: permission denied");
            self.send_notice(PERMISSION_DENIED_MESSAGE).await;
            return Err(SessionError::Authentication(
                "authenticator rejected the session".to_string(),
            ));
        }
        info!(session = %self, "connection established");

        if !self.context.registry().is_resolved() {
            self.state = SessionState::ServiceUnresolved;
            if let Some(transport) = self.transport.as_mut() {
                if transport.is_active() {
                    transport.close();
                }
            }
            warn!(session = %self, "session rejected: no shell, scp or sftp requested");
            return Err(SessionError::UnresolvedService);
        }

        self.context.registry().mark_ready();
        Ok(())
    }

    /// Create and connect an agent bridge if the client forwarded an agent.
    /// Leaves `self.agent` empty when it did not.
    async fn connect_agent(&mut self) -> Result<(), crate::error::AgentError> {
        let Some(mut bridge) = self.transport.as_ref().and_then(|t| t.agent_bridge()) else {
            return Ok(());
        };
        agent::connect_with_timeout(bridge.as_mut(), self.proxy.settings().agent_connect_timeout)
            .await?;
        debug!(
            session = %self,
            socket = ?bridge.socket_path(),
            "agent bridge connected"
        );
        self.agent = Some(bridge);
        Ok(())
    }

    async fn send_notice(&self, message: &str) {
        if let Some(channel) = &self.channel {
            if let Err(e) = channel.send(message.as_bytes()).await {
                debug!(session = %self, error = %e, "could not deliver notice to client");
            }
        }
    }

    /// Block until the transport terminates or the session is cancelled.
    pub async fn wait_finished(&self) {
        let interval = self.proxy.settings().accept_poll_interval;
        while self.transport_active() {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.context.cancelled() => break,
            }
        }
    }

    /// Release everything the session acquired. Idempotent.
    pub fn close(&mut self) {
        if let Some(transport) = self.transport.as_mut() {
            if transport.is_active() {
                transport.close();
            }
        }
        if !self.closed {
            info!(session = %self, "session closed");
        }
        self.context.request_close();
        if let Some(client) = self.context.registry().take_client() {
            debug!(session = %self, "closing bound service client");
            client.close();
        }
        if let Some(mut agent) = self.agent.take() {
            debug!(session = %self, "session cleaning up agent ...");
            agent.close();
            debug!(session = %self, "session agent cleaned up");
        }
        self.closed = true;
        self.state = SessionState::Closed;
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.context.name())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
