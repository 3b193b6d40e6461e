use crate::ssh::backend::{RusshChannel, TransportLink};
use crate::ssh::event::OneShotEvent;
use crate::ssh::interface::ServerInterface;
use crate::ssh::transport::{ChannelHandle, SubsystemHandler};
use std::collections::HashMap;
use std::sync::Arc;

use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Maximum size of an exec request payload.
const MAX_EXEC_COMMAND_LEN: usize = 4096;

/// Maximum number of session channels opened but not yet bound to a request.
pub const MAX_PENDING_CHANNELS: usize = 10;

/// russh callbacks for one proxied connection.
///
/// Credentials and channel requests are forwarded to the session's
/// [`ServerInterface`]. A channel is handed to the session's accept queue only
/// once the interface accepted its shell, exec or subsystem request.
pub struct ProxyHandler {
    conn_id: String,
    peer_addr: std::net::SocketAddr,
    server: Arc<dyn ServerInterface>,
    completion: OneShotEvent,
    link: Arc<TransportLink>,
    subsystems: HashMap<String, Arc<dyn SubsystemHandler>>,
    pending: HashMap<ChannelId, Channel<Msg>>,
    accepted: mpsc::UnboundedSender<ChannelHandle>,
    authenticated: bool,
    total_auth_attempts: u32,
}

impl ProxyHandler {
    pub fn new(
        conn_id: String,
        peer_addr: std::net::SocketAddr,
        server: Arc<dyn ServerInterface>,
        completion: OneShotEvent,
        link: Arc<TransportLink>,
        subsystems: HashMap<String, Arc<dyn SubsystemHandler>>,
        accepted: mpsc::UnboundedSender<ChannelHandle>,
    ) -> Self {
        Self {
            conn_id,
            peer_addr,
            server,
            completion,
            link,
            subsystems,
            pending: HashMap::new(),
            accepted,
            authenticated: false,
            total_auth_attempts: 0,
        }
    }

    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        }
    }

    /// Take a pending channel and wrap it for the session.
    fn take_pending(&mut self, channel: ChannelId, session: &Session) -> Option<ChannelHandle> {
        let inner = self.pending.remove(&channel)?;
        Some(Arc::new(RusshChannel::new(inner, session.handle())))
    }

    /// Acknowledge a channel request and queue the channel for the session, or
    /// refuse it.
    fn settle(&mut self, accepted: bool, handle: ChannelHandle, id: ChannelId, session: &mut Session) {
        if accepted {
            let _ = session.channel_success(id);
            if self.accepted.send(handle).is_err() {
                debug!(conn_id = %self.conn_id, channel = ?id, "session no longer accepting channels");
            }
        } else {
            let _ = session.channel_failure(id);
        }
    }
}

impl russh::server::Handler for ProxyHandler {
    type Error = anyhow::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        self.total_auth_attempts += 1;
        debug!(conn_id = %self.conn_id, user = %user, ip = %self.peer_addr, "auth_none attempt (rejected)");
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::from(
                [MethodKind::PublicKey, MethodKind::Password].as_slice(),
            )),
            partial_success: false,
        })
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        self.total_auth_attempts += 1;
        if self.server.check_auth_password(user, password) {
            info!(conn_id = %self.conn_id, user = %user, ip = %self.peer_addr, "Password auth accepted");
            Ok(Auth::Accept)
        } else {
            warn!(
                conn_id = %self.conn_id,
                user = %user,
                ip = %self.peer_addr,
                attempts = self.total_auth_attempts,
                "Password auth rejected"
            );
            Ok(Self::reject())
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        self.total_auth_attempts += 1;
        if self.server.check_auth_publickey(user, public_key) {
            info!(conn_id = %self.conn_id, user = %user, ip = %self.peer_addr, "Public key auth accepted");
            Ok(Auth::Accept)
        } else {
            warn!(
                conn_id = %self.conn_id,
                user = %user,
                ip = %self.peer_addr,
                attempts = self.total_auth_attempts,
                "Public key auth rejected"
            );
            Ok(Self::reject())
        }
    }

    async fn auth_succeeded(&mut self, _session: &mut Session) -> Result<(), Self::Error> {
        self.authenticated = true;
        self.completion.set();
        Ok(())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if !self.authenticated {
            return Ok(false);
        }
        if self.pending.len() >= MAX_PENDING_CHANNELS {
            warn!(
                conn_id = %self.conn_id,
                max = MAX_PENDING_CHANNELS,
                "Max pending session channels exceeded"
            );
            return Ok(false);
        }
        debug!(conn_id = %self.conn_id, channel = ?channel.id(), "session channel opened");
        self.pending.insert(channel.id(), channel);
        Ok(true)
    }

    async fn agent_request(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if !self.authenticated {
            return Ok(false);
        }
        let accepted = self.server.check_channel_forward_agent_request();
        if accepted {
            self.link.mark_agent_requested();
        }
        debug!(conn_id = %self.conn_id, channel = ?channel, accepted, "agent forwarding request");
        Ok(accepted)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = session.channel_success(channel);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(handle) = self.take_pending(channel, session) else {
            let _ = session.channel_failure(channel);
            return Ok(());
        };
        let accepted = self.server.check_channel_shell_request(handle.clone());
        self.settle(accepted, handle, channel, session);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if data.len() > MAX_EXEC_COMMAND_LEN {
            warn!(
                conn_id = %self.conn_id,
                data_len = data.len(),
                "exec_request data too large, rejecting"
            );
            let _ = session.channel_failure(channel);
            return Ok(());
        }
        let Some(handle) = self.take_pending(channel, session) else {
            let _ = session.channel_failure(channel);
            return Ok(());
        };
        let command = String::from_utf8_lossy(data).to_string();
        debug!(conn_id = %self.conn_id, channel = ?channel, command = %command, "exec_request received");
        let accepted = self.server.check_channel_exec_request(handle.clone(), &command);
        self.settle(accepted, handle, channel, session);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(subsystem) = self.subsystems.get(name).cloned() else {
            warn!(conn_id = %self.conn_id, subsystem = %name, ip = %self.peer_addr, "Unknown subsystem denied");
            let _ = session.channel_failure(channel);
            return Ok(());
        };
        let Some(handle) = self.take_pending(channel, session) else {
            let _ = session.channel_failure(channel);
            return Ok(());
        };
        let accepted =
            self.server
                .check_channel_subsystem_request(handle.clone(), name, subsystem.as_ref());
        self.settle(accepted, handle, channel, session);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.pending.remove(&channel);
        Ok(())
    }

    /// Reject reverse port forwarding (ssh -R).
    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        warn!(
            conn_id = %self.conn_id,
            address = %address,
            port = %port,
            ip = %self.peer_addr,
            "Reverse forwarding denied (tcpip_forward)"
        );
        Ok(false)
    }
}
