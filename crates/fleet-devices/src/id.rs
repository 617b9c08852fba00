use crate::DevicePathResolver;
use crate::error::{ResolveError, Result};
use crate::poll::{PollSettings, existing_target, poll_until, single_match, udev_trigger_and_settle};
use async_trait::async_trait;
use fleet_core::ports::{CommandRunner, FileSystem};
use fleet_core::settings::DiskSettings;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Virtio exposes at most this many characters of the disk serial.
const VIRTIO_SERIAL_LENGTH: usize = 20;

/// Finds a disk through the udev `by-id` links built from its serial.
pub struct IdDevicePathResolver {
    fs: Arc<dyn FileSystem>,
    runner: Arc<dyn CommandRunner>,
    poll: PollSettings,
}

impl IdDevicePathResolver {
    pub fn new(fs: Arc<dyn FileSystem>, runner: Arc<dyn CommandRunner>, poll: PollSettings) -> Self {
        Self { fs, runner, poll }
    }

    fn serial(device_id: &str) -> &str {
        match device_id.char_indices().nth(VIRTIO_SERIAL_LENGTH) {
            Some((end, _)) => &device_id[..end],
            None => device_id,
        }
    }
}

#[async_trait]
impl DevicePathResolver for IdDevicePathResolver {
    async fn get_real_device_path(&self, disk: &DiskSettings) -> Result<PathBuf> {
        if disk.device_id.is_empty() {
            return Err(ResolveError::MissingField("device id"));
        }

        udev_trigger_and_settle(self.runner.as_ref()).await?;

        let serial = Self::serial(&disk.device_id);
        let pattern = format!("/dev/disk/by-id/*{}", serial);
        debug!(device_id = %disk.device_id, %pattern, "Resolving device path by id");

        let fs = self.fs.as_ref();
        poll_until(self.poll, serial, || {
            let pattern = &pattern;
            async move {
                match single_match(fs, pattern).await? {
                    Some(link) => Ok(existing_target(fs, &link).await),
                    None => Ok(None),
                }
            }
        })
        .await
    }
}
