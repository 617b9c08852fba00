use crate::DevicePathResolver;
use crate::error::{ResolveError, Result};
use crate::poll::{PollSettings, poll_until};
use async_trait::async_trait;
use fleet_core::ports::FileSystem;
use fleet_core::settings::DiskSettings;
use std::path::PathBuf;
use std::sync::Arc;

const DEVICE_PREFIXES: [&str; 3] = ["/dev/sd", "/dev/vd", "/dev/xvd"];

/// Maps a `/dev/sdX` hint onto whichever of `sdX`, `vdX` or `xvdX` the
/// kernel actually created.
pub struct MappedDevicePathResolver {
    fs: Arc<dyn FileSystem>,
    poll: PollSettings,
}

impl MappedDevicePathResolver {
    pub fn new(fs: Arc<dyn FileSystem>, poll: PollSettings) -> Self {
        Self { fs, poll }
    }

    fn candidates(path: &str) -> Vec<PathBuf> {
        match path.strip_prefix("/dev/sd") {
            Some(suffix) => DEVICE_PREFIXES
                .iter()
                .map(|prefix| PathBuf::from(format!("{}{}", prefix, suffix)))
                .collect(),
            None => vec![PathBuf::from(path)],
        }
    }
}

#[async_trait]
impl DevicePathResolver for MappedDevicePathResolver {
    async fn get_real_device_path(&self, disk: &DiskSettings) -> Result<PathBuf> {
        if disk.path.is_empty() {
            return Err(ResolveError::MissingField("path"));
        }
        let candidates = Self::candidates(&disk.path);
        let fs = &self.fs;

        poll_until(self.poll, &disk.path, || {
            let candidates = &candidates;
            async move {
                for candidate in candidates {
                    if fs.exists(candidate).await {
                        return Ok(Some(candidate.clone()));
                    }
                }
                Ok(None)
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::fakes::FakeFileSystem;
    use std::time::Duration;

    fn disk(path: &str) -> DiskSettings {
        DiskSettings {
            path: path.to_string(),
            ..DiskSettings::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_prefers_sd_then_vd_then_xvd() {
        let fs = FakeFileSystem::new();
        fs.set_file("/dev/xvdb", "");
        fs.set_file("/dev/vdb", "");
        let resolver = MappedDevicePathResolver::new(fs.clone(), PollSettings::default());

        let path = resolver.get_real_device_path(&disk("/dev/sdb")).await.unwrap();
        assert_eq!(path, PathBuf::from("/dev/vdb"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_xen_device() {
        let fs = FakeFileSystem::new();
        fs.set_file("/dev/xvdf", "");
        let resolver = MappedDevicePathResolver::new(fs.clone(), PollSettings::default());

        let path = resolver.get_real_device_path(&disk("/dev/sdf")).await.unwrap();
        assert_eq!(path, PathBuf::from("/dev/xvdf"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_when_nothing_appears() {
        let fs = FakeFileSystem::new();
        let resolver =
            MappedDevicePathResolver::new(fs.clone(), PollSettings::new(Duration::from_secs(1)));

        let err = resolver.get_real_device_path(&disk("/dev/sdf")).await.unwrap_err();
        assert!(err.timed_out());
    }
}
