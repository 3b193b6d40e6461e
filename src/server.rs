use crate::auth::{Authenticator, AuthenticatorFactory, AuthorizedKeysAuthenticator};
use crate::config::types::{AppConfig, SessionConfig};
use crate::error::ConfigurationError;
use crate::ssh::backend::{AcceptedSocket, SshOptions};
use crate::ssh::cipher::CipherSuite;
use crate::ssh::context::SessionContext;
use crate::ssh::interface::{ProxyInterface, ServerInterface};
use crate::ssh::keys;
use crate::ssh::session::Session;
use crate::ssh::sftp::SftpSubsystem;
use crate::ssh::transport::{SubsystemHandler, TransportFactory};
use crate::utils::generate_correlation_id;

use anyhow::{Context, Result};
use russh::keys::PrivateKey;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// Lifecycle tuning every session of a proxy shares.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub accept_poll_interval: Duration,
    /// `None` waits for authentication without a bound.
    pub auth_timeout: Option<Duration>,
    pub agent_connect_timeout: Duration,
    pub ciphers: Option<CipherSuite>,
}

impl SessionSettings {
    pub fn from_config(config: &SessionConfig) -> Result<Self, ConfigurationError> {
        let ciphers = match &config.ciphers {
            Some(names) => Some(CipherSuite::new(names.iter().cloned())?),
            None => None,
        };
        Ok(Self {
            accept_poll_interval: config.accept_poll_interval(),
            auth_timeout: config.auth_timeout(),
            agent_connect_timeout: config.agent_connect_timeout(),
            ciphers,
        })
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            accept_poll_interval: Duration::from_millis(500),
            auth_timeout: None,
            agent_connect_timeout: Duration::from_secs(1),
            ciphers: None,
        }
    }
}

/// Builds the transport callback object bound to one session.
pub type InterfaceFactory =
    Arc<dyn Fn(Arc<SessionContext>) -> Arc<dyn ServerInterface> + Send + Sync>;

/// Proxy-wide state shared by every session.
pub struct ProxyServer {
    host_key: PrivateKey,
    settings: SessionSettings,
    ssh_options: SshOptions,
    drain_timeout: Duration,
    shutdown: CancellationToken,
    sftp: Arc<dyn SubsystemHandler>,
    authenticators: AuthenticatorFactory,
    interfaces: InterfaceFactory,
    active: AtomicUsize,
}

impl ProxyServer {
    pub fn new(host_key: PrivateKey, authenticators: AuthenticatorFactory) -> Self {
        Self {
            host_key,
            settings: SessionSettings::default(),
            ssh_options: SshOptions::default(),
            drain_timeout: Duration::from_secs(30),
            shutdown: CancellationToken::new(),
            sftp: Arc::new(SftpSubsystem),
            authenticators,
            interfaces: Arc::new(|session| Arc::new(ProxyInterface::new(session))),
            active: AtomicUsize::new(0),
        }
    }

    pub fn from_config(config: &AppConfig, host_key: PrivateKey) -> Result<Self> {
        let settings =
            SessionSettings::from_config(&config.session).context("session configuration")?;
        let authenticator = AuthorizedKeysAuthenticator::from_config(&config.auth);
        let keepalive = config.server.ssh_keepalive_interval_secs;
        Ok(Self::new(host_key, authenticator.factory())
            .with_settings(settings)
            .with_ssh_options(SshOptions {
                server_id: config.server.server_id.clone(),
                keepalive_interval: (keepalive > 0).then(|| Duration::from_secs(keepalive)),
                keepalive_max: config.server.ssh_keepalive_max as usize,
                auth_rejection_time: Duration::from_millis(config.server.auth_rejection_time_ms),
            })
            .with_drain_timeout(Duration::from_secs(config.server.shutdown_timeout)))
    }

    pub fn with_settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_ssh_options(mut self, options: SshOptions) -> Self {
        self.ssh_options = options;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_interface_factory(mut self, interfaces: InterfaceFactory) -> Self {
        self.interfaces = interfaces;
        self
    }

    pub fn with_sftp_handler(mut self, handler: Arc<dyn SubsystemHandler>) -> Self {
        self.sftp = handler;
        self
    }

    /// False once shutdown was requested.
    pub fn running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn host_key(&self) -> &PrivateKey {
        &self.host_key
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn ssh_options(&self) -> &SshOptions {
        &self.ssh_options
    }

    pub fn sftp_interface(&self) -> Arc<dyn SubsystemHandler> {
        self.sftp.clone()
    }

    pub fn authentication_interface(&self, session: Arc<SessionContext>) -> Arc<dyn ServerInterface> {
        (self.interfaces)(session)
    }

    pub fn new_authenticator(&self) -> Box<dyn Authenticator> {
        (self.authenticators)()
    }

    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

/// Decrements the active-session count when a connection task ends.
struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> ActiveGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Load the host key, bind the listener and serve until a shutdown signal.
pub async fn run(config: AppConfig) -> Result<()> {
    let host_key = keys::load_or_generate_host_key(&config.server.host_key_path)?;
    let proxy = Arc::new(ProxyServer::from_config(&config, host_key)?);

    let listener = TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("binding {}", config.server.listen))?;
    info!(addr = %config.server.listen, "SSH proxy listening");

    let shutdown = proxy.shutdown_token().clone();
    tokio::spawn(async move {
        handle_signals(shutdown).await;
    });

    serve(proxy, listener).await
}

/// Accept connections on `listener` and drive one session per connection until
/// the proxy is shut down, then drain active sessions.
pub async fn serve(proxy: Arc<ProxyServer>, listener: TcpListener) -> Result<()> {
    let shutdown = proxy.shutdown_token().clone();
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
            _ = shutdown.cancelled() => break,
        };

        let local = match stream.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!(peer = %peer, error = %e, "could not read local address, dropping connection");
                continue;
            }
        };
        let _ = stream.set_nodelay(true);

        let conn_id = generate_correlation_id();
        let span = tracing::info_span!("connection", conn_id = %conn_id, peer = %peer);
        let connection = Box::new(AcceptedSocket::new(
            stream,
            peer,
            conn_id.clone(),
            proxy.ssh_options().clone(),
        ));
        let proxy = proxy.clone();
        tokio::spawn(
            async move {
                info!("New SSH connection");
                serve_connection(proxy, connection, conn_id, peer, local).await;
            }
            .instrument(span),
        );
    }

    drain(&proxy).await;
    Ok(())
}

/// Drive one session through its lifecycle and release it.
pub async fn serve_connection(
    proxy: Arc<ProxyServer>,
    connection: Box<dyn TransportFactory>,
    conn_id: String,
    client: SocketAddr,
    local: SocketAddr,
) {
    let _active = ActiveGuard::enter(&proxy.active);
    let mut session = Session::with_conn_id(proxy.clone(), connection, conn_id, client, local);
    match session.start().await {
        Ok(()) => {
            debug!(session = %session, "waiting for session to finish");
            session.wait_finished().await;
        }
        Err(e) => {
            info!(session = %session, kind = e.kind(), error = %e, "session ended before becoming active");
        }
    }
    session.close();
}

async fn drain(proxy: &ProxyServer) {
    let timeout = proxy.drain_timeout;
    info!(timeout = ?timeout, "Initiating graceful shutdown");
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let active = proxy.active_sessions();
        if active == 0 {
            info!("All sessions drained");
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(active_sessions = active, "Shutdown timeout reached, forcing exit");
            return;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

#[cfg(unix)]
async fn handle_signals(shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to install SIGTERM handler");
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("SIGTERM received, initiating graceful shutdown"),
        _ = tokio::signal::ctrl_c() => info!("Ctrl-C received, initiating graceful shutdown"),
        _ = shutdown.cancelled() => return,
    }
    shutdown.cancel();
}

#[cfg(not(unix))]
async fn handle_signals(shutdown: CancellationToken) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, initiating graceful shutdown");
            shutdown.cancel();
        }
        _ = shutdown.cancelled() => {}
    }
}
