use crate::ssh::context::SessionContext;
use crate::ssh::registry::Service;
use crate::ssh::transport::{ChannelHandle, SubsystemHandler};
use russh::keys::PublicKey;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Callbacks the transport invokes while the client authenticates and issues
/// channel requests. One instance is bound to one session.
pub trait ServerInterface: Send + Sync {
    fn check_auth_publickey(&self, username: &str, key: &PublicKey) -> bool;

    fn check_auth_password(&self, username: &str, password: &str) -> bool;

    fn check_channel_shell_request(&self, channel: ChannelHandle) -> bool;

    fn check_channel_exec_request(&self, channel: ChannelHandle, command: &str) -> bool;

    fn check_channel_subsystem_request(
        &self,
        channel: ChannelHandle,
        name: &str,
        handler: &dyn SubsystemHandler,
    ) -> bool;

    fn check_channel_forward_agent_request(&self) -> bool;
}

/// Default interface: records the client's credentials on the session and
/// accepts them; the session's authenticator decides later whether the
/// connection may proceed. Channel requests claim the session's service.
pub struct ProxyInterface {
    session: Arc<SessionContext>,
}

impl ProxyInterface {
    pub fn new(session: Arc<SessionContext>) -> Self {
        Self { session }
    }

    fn claim(&self, service: Service) -> bool {
        let kind = service.kind();
        match self.session.registry().claim(service) {
            Ok(()) => {
                debug!(session = %self.session, service = %kind, "service claimed");
                true
            }
            Err(e) => {
                warn!(session = %self.session, service = %kind, error = %e, "service request rejected");
                false
            }
        }
    }
}

/// SHA256 fingerprint in OpenSSH notation.
pub fn key_fingerprint(key: &PublicKey) -> String {
    use base64::Engine;
    use russh::keys::PublicKeyBase64;
    use sha2::{Digest, Sha256};

    let key_bytes = base64::engine::general_purpose::STANDARD
        .decode(key.public_key_base64())
        .unwrap_or_default();
    let hash = Sha256::digest(&key_bytes);
    format!(
        "SHA256:{}",
        base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash)
    )
}

impl ServerInterface for ProxyInterface {
    fn check_auth_publickey(&self, username: &str, key: &PublicKey) -> bool {
        let fingerprint = key_fingerprint(key);
        info!(
            session = %self.session,
            user = %username,
            fingerprint = %fingerprint,
            "public key offered"
        );
        self.session.record_username(username, "publickey");
        self.session.record_key(key.clone(), fingerprint);
        true
    }

    fn check_auth_password(&self, username: &str, _password: &str) -> bool {
        info!(session = %self.session, user = %username, "password offered");
        self.session.record_username(username, "password");
        true
    }

    fn check_channel_shell_request(&self, channel: ChannelHandle) -> bool {
        self.claim(Service::Shell {
            channel,
            command: None,
        })
    }

    fn check_channel_exec_request(&self, channel: ChannelHandle, command: &str) -> bool {
        if command.starts_with("scp ") {
            self.claim(Service::Scp {
                channel,
                command: command.to_string(),
            })
        } else {
            self.claim(Service::Shell {
                channel,
                command: Some(command.to_string()),
            })
        }
    }

    fn check_channel_subsystem_request(
        &self,
        channel: ChannelHandle,
        name: &str,
        handler: &dyn SubsystemHandler,
    ) -> bool {
        handler.start(name, channel, self.session.registry())
    }

    fn check_channel_forward_agent_request(&self) -> bool {
        debug!(session = %self.session, "client requested agent forwarding");
        true
    }
}
