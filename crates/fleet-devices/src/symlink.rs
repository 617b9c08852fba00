use crate::DevicePathResolver;
use crate::error::{ResolveError, Result};
use crate::poll::{
    PollSettings, existing_target, poll_until, single_match, udev_trigger_and_settle,
};
use async_trait::async_trait;
use fleet_core::ports::{CommandRunner, FileSystem};
use fleet_core::settings::DiskSettings;
use std::path::PathBuf;
use std::sync::Arc;

/// Resolves NVMe-attached managed volumes through the udev links that embed
/// the volume id, e.g. `nvme-Amazon_Elastic_Block_Store_vol0123abcd`.
pub struct SymlinkDevicePathResolver {
    fs: Arc<dyn FileSystem>,
    runner: Arc<dyn CommandRunner>,
    poll: PollSettings,
}

impl SymlinkDevicePathResolver {
    pub fn new(fs: Arc<dyn FileSystem>, runner: Arc<dyn CommandRunner>, poll: PollSettings) -> Self {
        Self { fs, runner, poll }
    }
}

#[async_trait]
impl DevicePathResolver for SymlinkDevicePathResolver {
    async fn get_real_device_path(&self, disk: &DiskSettings) -> Result<PathBuf> {
        if disk.volume_id.is_empty() {
            return Err(ResolveError::MissingField("volume id"));
        }

        udev_trigger_and_settle(self.runner.as_ref()).await?;

        // udev drops the dash from volume ids when building link names.
        let pattern = format!("/dev/disk/by-id/*{}", disk.volume_id.replace('-', ""));
        let fs = self.fs.as_ref();

        poll_until(self.poll, &disk.volume_id, || {
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

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::fakes::{FakeCommandRunner, FakeFileSystem};

    #[tokio::test(start_paused = true)]
    async fn test_follows_ebs_link() {
        let fs = FakeFileSystem::new();
        fs.set_file("/dev/nvme2n1", "");
        fs.set_symlink(
            "/dev/disk/by-id/nvme-Amazon_Elastic_Block_Store_vol0123abcd",
            "../../nvme2n1",
        );
        let resolver =
            SymlinkDevicePathResolver::new(fs.clone(), FakeCommandRunner::new(), PollSettings::default());
        let disk = DiskSettings {
            volume_id: "vol-0123abcd".to_string(),
            ..DiskSettings::default()
        };

        let path = resolver.get_real_device_path(&disk).await.unwrap();
        assert_eq!(path, PathBuf::from("/dev/nvme2n1"));
    }
}
