pub mod pubkey;

use crate::config::types::AuthConfig;
use crate::ssh::agent::AgentBridge;
use crate::ssh::context::SessionContext;
use async_trait::async_trait;
use russh::keys::PublicKey;
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of delegated authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthResult {
    Success,
    Failure,
}

/// What an authenticator gets to see of the session it is bound to.
pub struct AuthContext<'a> {
    pub session: &'a SessionContext,
    pub agent: Option<&'a dyn AgentBridge>,
}

/// Authentication policy for one session.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Whether this policy needs the client's agent forwarded to the proxy.
    fn agent_forwarding_requested(&self) -> bool;

    async fn authenticate(&self, ctx: AuthContext<'_>) -> AuthResult;
}

/// Builds a fresh authenticator for every accepted session.
pub type AuthenticatorFactory = Arc<dyn Fn() -> Box<dyn Authenticator> + Send + Sync>;

/// Accepts a session when the public key the client offered is listed in the
/// configured authorized keys.
#[derive(Debug, Clone)]
pub struct AuthorizedKeysAuthenticator {
    authorized_keys: Arc<Vec<PublicKey>>,
    agent_forwarding: bool,
}

impl AuthorizedKeysAuthenticator {
    pub fn new(authorized_keys: Vec<PublicKey>, agent_forwarding: bool) -> Self {
        Self {
            authorized_keys: Arc::new(authorized_keys),
            agent_forwarding,
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(
            pubkey::parse_authorized_keys(&config.authorized_keys),
            config.agent_forwarding,
        )
    }

    /// Factory sharing the parsed key list across sessions.
    pub fn factory(self) -> AuthenticatorFactory {
        Arc::new(move || Box::new(self.clone()) as Box<dyn Authenticator>)
    }
}

#[async_trait]
impl Authenticator for AuthorizedKeysAuthenticator {
    fn agent_forwarding_requested(&self) -> bool {
        self.agent_forwarding
    }

    async fn authenticate(&self, ctx: AuthContext<'_>) -> AuthResult {
        let user = ctx.session.username().unwrap_or_default();
        let Some(key) = ctx.session.key() else {
            warn!(session = %ctx.session, user = %user, "auth failed: no public key offered");
            return AuthResult::Failure;
        };
        if pubkey::key_matches_parsed(&key, &self.authorized_keys) {
            info!(
                session = %ctx.session,
                user = %user,
                agent = ctx.agent.and_then(|a| a.socket_path()).map(|p| p.display().to_string()).unwrap_or_default(),
                "auth success"
            );
            AuthResult::Success
        } else {
            warn!(session = %ctx.session, user = %user, "auth failed: key not authorized");
            AuthResult::Failure
        }
    }
}
