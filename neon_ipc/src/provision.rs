//! Startup provisioning of all three channels from configuration.

use crate::channel::{ChannelDriver, PipeChannel, PipeDriver, QueueChannel, QueueDriver};
use crate::channel::{ShmChannel, ShmDriver};
use crate::cipher::PayloadCipher;
use crate::error::ChannelResult;
use shared_utils::config::{ChannelKind, ChannelsConfig};
use std::sync::Arc;
use tracing::info;

/// The provisioned channel handles.
#[derive(Debug)]
pub struct Channels {
    pub pipe: PipeChannel,
    pub queue: QueueChannel,
    pub shm: ShmChannel,
}

/// Create or open every channel and apply its configured security level.
///
/// Stops at the first failure, which names the channel.
pub fn provision(config: &ChannelsConfig) -> ChannelResult<Channels> {
    let pipe = PipeChannel::provision(&config.pipe.path, config.pipe.security)?;
    let queue = QueueChannel::provision(&config.queue.path, config.queue.security)?;
    let shm = ShmChannel::provision(&config.shm.path, config.shm.size, config.shm.security)?;

    info!("All channels provisioned");
    Ok(Channels { pipe, queue, shm })
}

impl Channels {
    /// Wrap each handle in its driver, in pipe, queue, shm order.
    pub fn into_drivers(
        self,
        config: &ChannelsConfig,
        cipher: Arc<dyn PayloadCipher>,
    ) -> Vec<Box<dyn ChannelDriver>> {
        vec![
            Box::new(PipeDriver::new(
                self.pipe,
                config.security(ChannelKind::Pipe),
                config.pipe.framing,
                Arc::clone(&cipher),
            )),
            Box::new(QueueDriver::new(
                self.queue,
                config.security(ChannelKind::Queue),
                Arc::clone(&cipher),
            )),
            Box::new(ShmDriver::new(
                self.shm,
                config.security(ChannelKind::Shm),
                config.shm.framing,
                cipher,
            )),
        ]
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use crate::cipher::XorCipher;
    use crate::error::ChannelError;
    use shared_utils::config::SecurityLevel;
    use tempfile::tempdir;

    fn config_in(dir: &std::path::Path) -> ChannelsConfig {
        let mut config = ChannelsConfig::default();
        config.pipe.path = dir.join("process_comm");
        config.queue.path = dir.join("data_stream");
        config.shm.path = dir.join("shared_cache");
        config
    }

    #[test]
    fn test_provision_all_high() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());

        let channels = provision(&config).unwrap();
        assert_eq!(channels.pipe.mode().unwrap(), 0o600);
        assert_eq!(channels.queue.mode().unwrap(), 0o600);
        assert_eq!(channels.shm.mode().unwrap(), 0o600);

        let cipher: Arc<dyn PayloadCipher> = Arc::new(XorCipher::new(b"neon_ipc_key").unwrap());
        let drivers = channels.into_drivers(&config, cipher);
        let kinds: Vec<ChannelKind> = drivers.iter().map(|d| d.kind()).collect();
        assert_eq!(kinds, ChannelKind::ALL.to_vec());
        assert!(drivers.iter().all(|d| d.security() == SecurityLevel::High));

        for driver in &drivers {
            driver.remove().unwrap();
        }
    }

    #[test]
    fn test_provision_failure_names_channel() {
        let dir = tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.pipe.path = dir.path().join("missing_dir").join("process_comm");

        match provision(&config) {
            Err(ChannelError::Provisioning { channel, .. }) => {
                assert_eq!(channel, ChannelKind::Pipe)
            }
            other => panic!("expected a provisioning error, got {other:?}"),
        }
    }
}
