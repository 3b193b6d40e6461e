use crate::ssh::event::OneShotEvent;
use crate::ssh::transport::ChannelHandle;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

/// Which high-level service owns the session's main channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ServiceKind {
    #[default]
    Unset,
    Shell,
    Scp,
    Sftp,
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceKind::Unset => write!(f, "unset"),
            ServiceKind::Shell => write!(f, "shell"),
            ServiceKind::Scp => write!(f, "scp"),
            ServiceKind::Sftp => write!(f, "sftp"),
        }
    }
}

/// A resolved service claim together with its per-kind payload.
#[derive(Debug, Clone)]
pub enum Service {
    /// Interactive shell, or a plain remote command when `command` is set.
    Shell {
        channel: ChannelHandle,
        command: Option<String>,
    },
    Scp {
        channel: ChannelHandle,
        command: String,
    },
    Sftp {
        channel: ChannelHandle,
    },
}

impl Service {
    pub fn kind(&self) -> ServiceKind {
        match self {
            Service::Shell { .. } => ServiceKind::Shell,
            Service::Scp { .. } => ServiceKind::Scp,
            Service::Sftp { .. } => ServiceKind::Sftp,
        }
    }

    pub fn channel(&self) -> &ChannelHandle {
        match self {
            Service::Shell { channel, .. }
            | Service::Scp { channel, .. }
            | Service::Sftp { channel } => channel,
        }
    }
}

/// Locally-originated client already serving this session (e.g. when the session
/// multiplexes an existing connection).
pub trait ServiceClient: Send + Sync {
    fn close(&self);
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("session service already claimed as {0}")]
    AlreadyClaimed(ServiceKind),
}

#[derive(Default)]
struct RegistryInner {
    service: Option<Service>,
    client: Option<Arc<dyn ServiceClient>>,
}

/// Tracks the single service claiming the main channel, the optional bound
/// service client, and the one-shot readiness signal.
#[derive(Default)]
pub struct ChannelRegistry {
    inner: Mutex<RegistryInner>,
    ready: OneShotEvent,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record `service` as the session's service. Only the first claim wins.
    pub fn claim(&self, service: Service) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        if let Some(existing) = &inner.service {
            return Err(RegistryError::AlreadyClaimed(existing.kind()));
        }
        inner.service = Some(service);
        Ok(())
    }

    pub fn kind(&self) -> ServiceKind {
        self.lock()
            .service
            .as_ref()
            .map(Service::kind)
            .unwrap_or_default()
    }

    pub fn is_resolved(&self) -> bool {
        self.lock().service.is_some()
    }

    pub fn service(&self) -> Option<Service> {
        self.lock().service.clone()
    }

    pub fn service_channel(&self) -> Option<ChannelHandle> {
        self.lock().service.as_ref().map(|s| s.channel().clone())
    }

    pub fn scp_command(&self) -> Option<String> {
        match &self.lock().service {
            Some(Service::Scp { command, .. }) => Some(command.clone()),
            _ => None,
        }
    }

    /// Bind a service client, returning the one it replaced.
    pub fn bind_client(&self, client: Arc<dyn ServiceClient>) -> Option<Arc<dyn ServiceClient>> {
        self.lock().client.replace(client)
    }

    pub fn client(&self) -> Option<Arc<dyn ServiceClient>> {
        self.lock().client.clone()
    }

    pub fn has_client(&self) -> bool {
        self.lock().client.is_some()
    }

    pub(crate) fn take_client(&self) -> Option<Arc<dyn ServiceClient>> {
        self.lock().client.take()
    }

    /// Fire the readiness signal. Returns `true` only the first time.
    pub fn mark_ready(&self) -> bool {
        self.ready.set()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.is_set()
    }

    pub async fn wait_ready(&self) {
        self.ready.wait().await
    }
}

impl fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("ChannelRegistry")
            .field("kind", &inner.service.as_ref().map(Service::kind))
            .field("client", &inner.client.is_some())
            .field("ready", &self.ready.is_set())
            .finish()
    }
}
