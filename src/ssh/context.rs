use crate::ssh::registry::ChannelRegistry;
use russh::keys::PublicKey;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

/// Authentication metadata recorded while the client authenticates.
#[derive(Debug, Clone, Default)]
pub struct SessionMetadata {
    pub username: Option<String>,
    /// Upstream target chosen by the authenticator (`host:port`).
    pub remote_address: Option<String>,
    pub key: Option<PublicKey>,
    pub key_fingerprint: Option<String>,
    pub auth_method: Option<String>,
}

/// State of one session that is shared with the transport's callbacks and with
/// downstream service handlers.
pub struct SessionContext {
    name: String,
    conn_id: String,
    client_address: SocketAddr,
    socket_remote_address: SocketAddr,
    metadata: Mutex<SessionMetadata>,
    registry: ChannelRegistry,
    cancel: CancellationToken,
}

impl SessionContext {
    pub fn new(
        conn_id: String,
        client_address: SocketAddr,
        socket_remote_address: SocketAddr,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            name: crate::utils::session_name(&client_address, &socket_remote_address),
            conn_id,
            client_address,
            socket_remote_address,
            metadata: Mutex::new(SessionMetadata::default()),
            registry: ChannelRegistry::new(),
            cancel,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    pub fn client_address(&self) -> SocketAddr {
        self.client_address
    }

    /// Local address of the accepted socket (the destination the client dialed).
    pub fn socket_remote_address(&self) -> SocketAddr {
        self.socket_remote_address
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    fn lock(&self) -> MutexGuard<'_, SessionMetadata> {
        self.metadata.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn metadata(&self) -> SessionMetadata {
        self.lock().clone()
    }

    pub fn username(&self) -> Option<String> {
        self.lock().username.clone()
    }

    pub fn key(&self) -> Option<PublicKey> {
        self.lock().key.clone()
    }

    pub fn remote_address(&self) -> Option<String> {
        self.lock().remote_address.clone()
    }

    pub fn record_username(&self, username: &str, method: &str) {
        let mut meta = self.lock();
        meta.username = Some(username.to_string());
        meta.auth_method = Some(method.to_string());
    }

    pub fn record_key(&self, key: PublicKey, fingerprint: String) {
        let mut meta = self.lock();
        meta.key = Some(key);
        meta.key_fingerprint = Some(fingerprint);
    }

    pub fn set_remote_address(&self, address: impl Into<String>) {
        self.lock().remote_address = Some(address.into());
    }

    /// Ask the session to stop. Interrupts a pending channel accept or auth wait
    /// and is observed by service tasks through [`Self::cancelled`].
    pub fn request_close(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

impl fmt::Display for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("name", &self.name)
            .field("conn_id", &self.conn_id)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
