//! russh implementation of the transport seams.

use crate::error::{AgentError, ConfigurationError, TransportError};
use crate::ssh::agent::AgentBridge;
use crate::ssh::cipher::CipherSuite;
use crate::ssh::event::OneShotEvent;
use crate::ssh::handler::ProxyHandler;
use crate::ssh::interface::ServerInterface;
use crate::ssh::transport::{Channel, ChannelHandle, SubsystemHandler, Transport, TransportFactory};
use async_trait::async_trait;
use russh::keys::PrivateKey;
use russh::server::{Handle, Msg};
use russh::{ChannelId, CryptoVec};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Map a cipher name onto the russh constant.
pub fn russh_cipher(name: &str) -> Option<russh::cipher::Name> {
    match name {
        "chacha20-poly1305@openssh.com" => Some(russh::cipher::CHACHA20_POLY1305),
        "aes256-gcm@openssh.com" => Some(russh::cipher::AES_256_GCM),
        "aes256-ctr" => Some(russh::cipher::AES_256_CTR),
        "aes192-ctr" => Some(russh::cipher::AES_192_CTR),
        "aes128-ctr" => Some(russh::cipher::AES_128_CTR),
        _ => None,
    }
}

/// How long a closing transport keeps flushing before the connection is dropped.
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

/// Protocol options shared by every transport the server builds.
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub server_id: String,
    pub keepalive_interval: Option<Duration>,
    pub keepalive_max: usize,
    pub auth_rejection_time: Duration,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            server_id: format!("SSH-2.0-sshproxy_{}", env!("CARGO_PKG_VERSION")),
            keepalive_interval: Some(Duration::from_secs(15)),
            keepalive_max: 3,
            auth_rejection_time: Duration::from_secs(1),
        }
    }
}

/// State shared between a transport, its connection task and its handler.
pub struct TransportLink {
    active: AtomicBool,
    agent_requested: AtomicBool,
    handle: Mutex<Option<Handle>>,
    cancel: CancellationToken,
}

impl TransportLink {
    fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            agent_requested: AtomicBool::new(false),
            handle: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn mark_agent_requested(&self) {
        self.agent_requested.store(true, Ordering::Release);
    }

    pub fn agent_requested(&self) -> bool {
        self.agent_requested.load(Ordering::Acquire)
    }

    fn set_handle(&self, handle: Handle) {
        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    fn handle(&self) -> Option<Handle> {
        self.handle.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn terminate(&self) {
        self.active.store(false, Ordering::Release);
    }
}

/// An accepted TCP socket waiting to be turned into a transport.
pub struct AcceptedSocket {
    stream: TcpStream,
    peer_addr: SocketAddr,
    conn_id: String,
    options: SshOptions,
}

impl AcceptedSocket {
    pub fn new(stream: TcpStream, peer_addr: SocketAddr, conn_id: String, options: SshOptions) -> Self {
        Self {
            stream,
            peer_addr,
            conn_id,
            options,
        }
    }
}

impl TransportFactory for AcceptedSocket {
    fn build(self: Box<Self>) -> Box<dyn Transport> {
        let AcceptedSocket {
            stream,
            peer_addr,
            conn_id,
            options,
        } = *self;
        Box::new(RusshTransport::new(stream, peer_addr, conn_id, options))
    }
}

/// Server side of one SSH connection, backed by russh.
pub struct RusshTransport {
    stream: Option<TcpStream>,
    peer_addr: SocketAddr,
    conn_id: String,
    options: SshOptions,
    keys: Vec<PrivateKey>,
    ciphers: Option<Vec<russh::cipher::Name>>,
    subsystems: HashMap<String, Arc<dyn SubsystemHandler>>,
    link: Arc<TransportLink>,
    channels: Option<mpsc::UnboundedReceiver<ChannelHandle>>,
}

impl RusshTransport {
    pub fn new(stream: TcpStream, peer_addr: SocketAddr, conn_id: String, options: SshOptions) -> Self {
        Self {
            stream: Some(stream),
            peer_addr,
            conn_id,
            options,
            keys: Vec::new(),
            ciphers: None,
            subsystems: HashMap::new(),
            link: Arc::new(TransportLink::new()),
            channels: None,
        }
    }

    fn build_config(&mut self) -> russh::server::Config {
        let mut config = russh::server::Config::default();
        config.keys = std::mem::take(&mut self.keys);
        config.server_id = russh::SshId::Standard(self.options.server_id.clone());
        config.auth_rejection_time = self.options.auth_rejection_time;
        config.auth_rejection_time_initial = Some(Duration::from_secs(0));
        if let Some(interval) = self.options.keepalive_interval {
            config.keepalive_interval = Some(interval);
            config.keepalive_max = self.options.keepalive_max;
        }
        if let Some(ciphers) = &self.ciphers {
            config.preferred = russh::Preferred {
                cipher: Cow::Owned(ciphers.clone()),
                ..Default::default()
            };
        }
        config
    }
}

#[async_trait]
impl Transport for RusshTransport {
    fn set_ciphers(&mut self, ciphers: &CipherSuite) -> Result<(), ConfigurationError> {
        let names = ciphers
            .names()
            .iter()
            .map(|name| {
                russh_cipher(name).ok_or_else(|| ConfigurationError::UnsupportedCipher(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.ciphers = Some(names);
        Ok(())
    }

    fn add_server_key(&mut self, key: PrivateKey) {
        self.keys.push(key);
    }

    fn set_subsystem_handler(&mut self, name: &str, handler: Arc<dyn SubsystemHandler>) {
        self.subsystems.insert(name.to_string(), handler);
    }

    fn start_server(
        &mut self,
        completion: OneShotEvent,
        server: Arc<dyn ServerInterface>,
    ) -> Result<(), TransportError> {
        let stream = self.stream.take().ok_or(TransportError::AlreadyStarted)?;
        let config = Arc::new(self.build_config());
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels = Some(rx);

        let handler = ProxyHandler::new(
            self.conn_id.clone(),
            self.peer_addr,
            server,
            completion.clone(),
            self.link.clone(),
            std::mem::take(&mut self.subsystems),
            tx,
        );

        let link = self.link.clone();
        let conn_id = self.conn_id.clone();
        link.active.store(true, Ordering::Release);
        tokio::spawn(async move {
            let running = tokio::select! {
                running = russh::server::run_stream(config, stream, handler) => running,
                _ = link.cancel.cancelled() => {
                    link.terminate();
                    completion.set();
                    return;
                }
            };
            match running {
                Ok(running) => {
                    let handle = running.handle();
                    link.set_handle(handle.clone());
                    tokio::pin!(running);
                    tokio::select! {
                        result = &mut running => {
                            if let Err(e) = result {
                                debug!(conn_id = %conn_id, error = %e, "SSH session ended with error");
                            }
                        }
                        _ = link.cancel.cancelled() => {
                            let _ = handle
                                .disconnect(
                                    russh::Disconnect::ByApplication,
                                    "session closed".to_string(),
                                    "en".to_string(),
                                )
                                .await;
                            // Let queued channel data and the disconnect reach the client.
                            let _ = tokio::time::timeout(DISCONNECT_GRACE, &mut running).await;
                        }
                    }
                }
                Err(e) => {
                    debug!(conn_id = %conn_id, error = %e, "SSH handshake failed");
                }
            }
            link.terminate();
            completion.set();
        });
        Ok(())
    }

    async fn accept(&mut self, timeout: Duration) -> Option<ChannelHandle> {
        let channels = self.channels.as_mut()?;
        match tokio::time::timeout(timeout, channels.recv()).await {
            Ok(channel) => channel,
            Err(_) => None,
        }
    }

    fn is_active(&self) -> bool {
        self.link.is_active()
    }

    fn close(&mut self) {
        self.link.terminate();
        self.link.cancel.cancel();
        self.channels = None;
    }

    fn agent_bridge(&self) -> Option<Box<dyn AgentBridge>> {
        if !self.link.agent_requested() {
            return None;
        }
        Some(Box::new(RusshAgentBridge::new(
            self.link.clone(),
            self.conn_id.clone(),
        )))
    }
}

impl Drop for RusshTransport {
    fn drop(&mut self) {
        self.link.cancel.cancel();
    }
}

/// Session channel of a russh connection.
pub struct RusshChannel {
    id: ChannelId,
    handle: Handle,
    inner: tokio::sync::Mutex<Option<russh::Channel<Msg>>>,
}

impl RusshChannel {
    pub fn new(inner: russh::Channel<Msg>, handle: Handle) -> Self {
        Self {
            id: inner.id(),
            handle,
            inner: tokio::sync::Mutex::new(Some(inner)),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Take the underlying russh channel, e.g. to turn it into a stream for the
    /// service that consumes it. Returns `None` after the first call.
    pub async fn take(&self) -> Option<russh::Channel<Msg>> {
        self.inner.lock().await.take()
    }
}

impl fmt::Debug for RusshChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RusshChannel").field("id", &self.id).finish()
    }
}

#[async_trait]
impl Channel for RusshChannel {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        self.handle
            .data(self.id, CryptoVec::from_slice(data))
            .await
            .map_err(|_| TransportError::ChannelClosed)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.handle
            .close(self.id)
            .await
            .map_err(|_| TransportError::ChannelClosed)
    }
}

/// Exposes the client's forwarded agent as a local unix socket.
///
/// `connect` probes the agent by opening one agent channel, then serves every
/// local connection on the socket through a fresh agent channel.
pub struct RusshAgentBridge {
    link: Arc<TransportLink>,
    conn_id: String,
    socket_dir: Option<PathBuf>,
    socket_path: Option<PathBuf>,
    cancel: CancellationToken,
}

impl RusshAgentBridge {
    fn new(link: Arc<TransportLink>, conn_id: String) -> Self {
        Self {
            link,
            conn_id,
            socket_dir: None,
            socket_path: None,
            cancel: CancellationToken::new(),
        }
    }
}

#[cfg(unix)]
fn create_socket_dir(conn_id: &str) -> std::io::Result<PathBuf> {
    use std::os::unix::fs::DirBuilderExt;
    let dir = std::env::temp_dir().join(format!("sshproxy-agent-{}", conn_id));
    std::fs::DirBuilder::new().mode(0o700).create(&dir)?;
    Ok(dir)
}

#[cfg(unix)]
async fn relay_agent_connections(
    listener: tokio::net::UnixListener,
    handle: Handle,
    cancel: CancellationToken,
    conn_id: String,
) {
    loop {
        let stream = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!(conn_id = %conn_id, error = %e, "agent socket accept error");
                    break;
                }
            },
            _ = cancel.cancelled() => break,
        };
        let handle = handle.clone();
        let conn_id = conn_id.clone();
        tokio::spawn(async move {
            let mut local = stream;
            match handle.channel_open_agent().await {
                Ok(channel) => {
                    let mut remote = channel.into_stream();
                    if let Err(e) = tokio::io::copy_bidirectional(&mut local, &mut remote).await {
                        debug!(conn_id = %conn_id, error = %e, "agent relay ended");
                    }
                }
                Err(e) => {
                    warn!(conn_id = %conn_id, error = %e, "client refused agent channel");
                }
            }
        });
    }
}

#[async_trait]
impl AgentBridge for RusshAgentBridge {
    #[cfg(unix)]
    async fn connect(&mut self) -> Result<(), AgentError> {
        let handle = self.link.handle().ok_or_else(|| {
            AgentError::ChannelRefused("transport not running".to_string())
        })?;
        let probe = handle
            .channel_open_agent()
            .await
            .map_err(|e| AgentError::ChannelRefused(e.to_string()))?;
        let _ = probe.close().await;

        let dir = create_socket_dir(&self.conn_id)?;
        self.socket_dir = Some(dir.clone());
        let path = dir.join("agent.sock");
        let listener = tokio::net::UnixListener::bind(&path)?;
        self.socket_path = Some(path);

        tokio::spawn(relay_agent_connections(
            listener,
            handle,
            self.cancel.clone(),
            self.conn_id.clone(),
        ));
        Ok(())
    }

    #[cfg(not(unix))]
    async fn connect(&mut self) -> Result<(), AgentError> {
        Err(AgentError::Unsupported)
    }

    fn close(&mut self) {
        self.cancel.cancel();
        if let Some(path) = self.socket_path.take() {
            let _ = std::fs::remove_file(&path);
        }
        if let Some(dir) = self.socket_dir.take() {
            let _ = std::fs::remove_dir(&dir);
        }
    }

    fn socket_path(&self) -> Option<&Path> {
        self.socket_path.as_deref()
    }
}

impl Drop for RusshAgentBridge {
    fn drop(&mut self) {
        self.close();
    }
}
