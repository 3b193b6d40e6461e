use crate::ssh::registry::{ChannelRegistry, Service};
use crate::ssh::transport::{ChannelHandle, SubsystemHandler};
use tracing::{debug, warn};

/// Subsystem handler registered under `sftp`. It claims the session's service
/// and parks the channel in the registry for the SFTP consumer that picks the
/// session up once it is ready.
#[derive(Debug, Default)]
pub struct SftpSubsystem;

impl SubsystemHandler for SftpSubsystem {
    fn start(&self, name: &str, channel: ChannelHandle, registry: &ChannelRegistry) -> bool {
        if name != "sftp" {
            warn!(subsystem = %name, "sftp handler asked to serve another subsystem");
            return false;
        }
        match registry.claim(Service::Sftp { channel }) {
            Ok(()) => {
                debug!("sftp subsystem claimed session");
                true
            }
            Err(e) => {
                warn!(error = %e, "sftp subsystem request rejected");
                false
            }
        }
    }
}
