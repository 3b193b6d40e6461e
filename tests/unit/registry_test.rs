use async_trait::async_trait;
use sshproxy::error::TransportError;
use sshproxy::ssh::registry::{ChannelRegistry, RegistryError, Service, ServiceClient, ServiceKind};
use sshproxy::ssh::transport::{Channel, ChannelHandle};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
struct NullChannel;

#[async_trait]
impl Channel for NullChannel {
    async fn send(&self, _data: &[u8]) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

fn channel() -> ChannelHandle {
    Arc::new(NullChannel)
}

#[derive(Default)]
struct CountingClient {
    closes: AtomicUsize,
}

impl ServiceClient for CountingClient {
    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn first_claim_wins_for_every_kind() {
    let candidates = || {
        vec![
            Service::Shell {
                channel: channel(),
                command: None,
            },
            Service::Scp {
                channel: channel(),
                command: "scp -f /etc/motd".into(),
            },
            Service::Sftp { channel: channel() },
        ]
    };

    for first in candidates() {
        let registry = ChannelRegistry::new();
        let kind = first.kind();
        registry.claim(first).unwrap();
        for other in candidates() {
            assert_eq!(
                registry.claim(other),
                Err(RegistryError::AlreadyClaimed(kind))
            );
        }
        assert_eq!(registry.kind(), kind);
        assert!(registry.is_resolved());
    }
}

#[test]
fn claimed_channel_is_retrievable() {
    let registry = ChannelRegistry::new();
    let ch = channel();
    registry
        .claim(Service::Shell {
            channel: ch.clone(),
            command: Some("uptime".into()),
        })
        .unwrap();

    let stored = registry.service_channel().unwrap();
    assert!(Arc::ptr_eq(&stored, &ch));
    assert!(registry.scp_command().is_none());
    match registry.service() {
        Some(Service::Shell { command, .. }) => assert_eq!(command.as_deref(), Some("uptime")),
        other => panic!("unexpected service: {other:?}"),
    }
}

#[test]
fn ready_fires_once() {
    let registry = ChannelRegistry::new();
    assert!(!registry.is_ready());
    assert!(registry.mark_ready());
    assert!(!registry.mark_ready());
    assert!(registry.is_ready());
}

#[tokio::test]
async fn waiters_released_by_ready() {
    let registry = Arc::new(ChannelRegistry::new());
    let waiter = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.wait_ready().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    registry.mark_ready();
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .unwrap()
        .unwrap();
}

#[test]
fn bind_client_replaces_previous() {
    let registry = ChannelRegistry::new();
    assert!(!registry.has_client());

    let first = Arc::new(CountingClient::default());
    let second = Arc::new(CountingClient::default());
    assert!(registry.bind_client(first.clone()).is_none());
    assert!(registry.has_client());

    let replaced = registry.bind_client(second.clone()).unwrap();
    replaced.close();
    assert_eq!(first.closes.load(Ordering::SeqCst), 1);
    assert_eq!(second.closes.load(Ordering::SeqCst), 0);
    assert!(registry.client().is_some());
}

#[test]
fn service_kind_labels() {
    assert_eq!(ServiceKind::default(), ServiceKind::Unset);
    assert_eq!(ServiceKind::Shell.to_string(), "shell");
    assert_eq!(ServiceKind::Scp.to_string(), "scp");
    assert_eq!(ServiceKind::Sftp.to_string(), "sftp");
}
