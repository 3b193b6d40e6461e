use crate::error::AgentError;
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Bridge between the client's forwarded agent and a local endpoint the proxy's
/// outbound client can use.
#[async_trait]
pub trait AgentBridge: Send + Sync {
    async fn connect(&mut self) -> Result<(), AgentError>;

    /// Release the bridge. Safe whether or not `connect` ran or succeeded.
    fn close(&mut self);

    /// Local endpoint (`SSH_AUTH_SOCK`) once connected.
    fn socket_path(&self) -> Option<&Path>;
}

/// Connect `bridge`, giving up after `limit`. On any failure the bridge is closed
/// before the error is returned.
pub async fn connect_with_timeout(
    bridge: &mut dyn AgentBridge,
    limit: Duration,
) -> Result<(), AgentError> {
    let result = match tokio::time::timeout(limit, bridge.connect()).await {
        Ok(result) => result,
        Err(_) => Err(AgentError::Timeout(limit)),
    };
    if let Err(ref e) = result {
        debug!(error = %e, "agent bridge connect failed, releasing bridge");
        bridge.close();
    }
    result
}
