//! Discovery of host-local ephemeral disks.

use crate::DevicePathResolver;
use crate::error::{ResolveError, Result};
use async_trait::async_trait;
use fleet_core::ports::FileSystem;
use fleet_core::settings::DiskSettings;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

pub const NVME_DEVICE_PATTERN: &str = "/dev/nvme*n1";
pub const EBS_SYMLINK_PATTERN: &str = "/dev/disk/by-id/nvme-Amazon_Elastic_Block_Store_*";

/// Maps the infrastructure's ephemeral disk list to device paths.
#[async_trait]
pub trait InstanceStorageResolver: Send + Sync {
    async fn discover_instance_storage(&self, disks: &[DiskSettings]) -> Result<Vec<PathBuf>>;
}

/// Resolves each declared disk through a device path resolver.
pub struct IdentityInstanceStorageResolver {
    resolver: Arc<dyn DevicePathResolver>,
}

impl IdentityInstanceStorageResolver {
    pub fn new(resolver: Arc<dyn DevicePathResolver>) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl InstanceStorageResolver for IdentityInstanceStorageResolver {
    async fn discover_instance_storage(&self, disks: &[DiskSettings]) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::with_capacity(disks.len());
        for disk in disks {
            let path = self
                .resolver
                .get_real_device_path(disk)
                .await
                .map_err(|e| e.context(format!("Resolving instance storage disk '{}'", disk.path)))?;
            paths.push(path);
        }
        Ok(paths)
    }
}

/// Treats every NVMe namespace that is not a managed volume as instance
/// storage.
///
/// The declared paths are ignored since NVMe enumeration order does not
/// follow attachment order. Only their count matters, and it must match.
pub struct NvmeInstanceStorageResolver {
    fs: Arc<dyn FileSystem>,
    device_pattern: String,
    managed_symlink_patterns: Vec<String>,
}

impl NvmeInstanceStorageResolver {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self {
            fs,
            device_pattern: NVME_DEVICE_PATTERN.to_string(),
            managed_symlink_patterns: vec![EBS_SYMLINK_PATTERN.to_string()],
        }
    }

    pub fn with_patterns(
        fs: Arc<dyn FileSystem>,
        device_pattern: impl Into<String>,
        managed_symlink_patterns: Vec<String>,
    ) -> Self {
        Self {
            fs,
            device_pattern: device_pattern.into(),
            managed_symlink_patterns,
        }
    }

    async fn managed_devices(&self) -> Result<BTreeSet<PathBuf>> {
        let mut managed = BTreeSet::new();
        for pattern in &self.managed_symlink_patterns {
            let links = self
                .fs
                .glob(pattern)
                .await
                .map_err(|e| ResolveError::from(e).context("Listing managed volume links"))?;
            for link in links {
                match self.fs.canonicalize(&link).await {
                    Ok(target) => {
                        debug!(link = %link.display(), target = %target.display(), "Managed volume");
                        managed.insert(target);
                    }
                    Err(e) => warn!(link = %link.display(), error = %e, "Skipping dangling managed volume link"),
                }
            }
        }
        Ok(managed)
    }
}

#[async_trait]
impl InstanceStorageResolver for NvmeInstanceStorageResolver {
    async fn discover_instance_storage(&self, disks: &[DiskSettings]) -> Result<Vec<PathBuf>> {
        let devices = self
            .fs
            .glob(&self.device_pattern)
            .await
            .map_err(|e| ResolveError::from(e).context("Listing NVMe devices"))?;
        let managed = self.managed_devices().await?;

        let instance_storage: Vec<PathBuf> = devices
            .into_iter()
            .filter(|device| !managed.contains(device))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        if instance_storage.len() != disks.len() {
            return Err(ResolveError::InstanceStorageMismatch {
                expected: disks.len(),
                discovered: instance_storage.len(),
                devices: instance_storage.iter().map(|p| p.display().to_string()).collect(),
            });
        }

        info!(count = instance_storage.len(), "Discovered NVMe instance storage");
        Ok(instance_storage)
    }
}

/// Picks the NVMe or identity strategy on the first call, based on whether
/// any declared path names an NVMe device. The choice is never revisited.
pub struct AutoDetectingInstanceStorageResolver {
    identity: Arc<dyn InstanceStorageResolver>,
    nvme: Arc<dyn InstanceStorageResolver>,
    selected: OnceCell<Arc<dyn InstanceStorageResolver>>,
}

impl AutoDetectingInstanceStorageResolver {
    pub fn new(identity: Arc<dyn InstanceStorageResolver>, nvme: Arc<dyn InstanceStorageResolver>) -> Self {
        Self {
            identity,
            nvme,
            selected: OnceCell::new(),
        }
    }
}

#[async_trait]
impl InstanceStorageResolver for AutoDetectingInstanceStorageResolver {
    async fn discover_instance_storage(&self, disks: &[DiskSettings]) -> Result<Vec<PathBuf>> {
        let resolver = self
            .selected
            .get_or_init(|| async {
                if disks.iter().any(|d| d.path.starts_with("/dev/nvme")) {
                    self.nvme.clone()
                } else {
                    self.identity.clone()
                }
            })
            .await;
        resolver.discover_instance_storage(disks).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IdentityDevicePathResolver;
    use fleet_core::fakes::FakeFileSystem;
    use pretty_assertions::assert_eq;

    fn disks(paths: &[&str]) -> Vec<DiskSettings> {
        paths
            .iter()
            .map(|p| DiskSettings {
                path: p.to_string(),
                ..DiskSettings::default()
            })
            .collect()
    }

    fn nvme_fs() -> Arc<FakeFileSystem> {
        let fs = FakeFileSystem::new();
        for dev in ["/dev/nvme2n1", "/dev/nvme0n1", "/dev/nvme1n1"] {
            fs.set_file(dev, "");
        }
        fs
    }

    #[tokio::test]
    async fn test_excludes_managed_volumes() {
        let fs = nvme_fs();
        fs.set_symlink(
            "/dev/disk/by-id/nvme-Amazon_Elastic_Block_Store_vol0abc",
            "../../nvme0n1",
        );
        let resolver = NvmeInstanceStorageResolver::new(fs.clone());

        let found = resolver
            .discover_instance_storage(&disks(&["/dev/nvme1n1", "/dev/nvme2n1"]))
            .await
            .unwrap();

        assert_eq!(found, vec![PathBuf::from("/dev/nvme1n1"), PathBuf::from("/dev/nvme2n1")]);
    }

    #[tokio::test]
    async fn test_count_mismatch_is_an_error() {
        let fs = nvme_fs();
        for (i, dev) in ["nvme0n1", "nvme1n1", "nvme2n1"].iter().enumerate() {
            fs.set_symlink(
                format!("/dev/disk/by-id/nvme-Amazon_Elastic_Block_Store_vol{}", i),
                format!("../../{}", dev),
            );
        }
        let resolver = NvmeInstanceStorageResolver::new(fs.clone());

        let err = resolver
            .discover_instance_storage(&disks(&["/dev/nvme0n1", "/dev/nvme1n1", "/dev/nvme2n1"]))
            .await
            .unwrap_err();

        assert!(err.to_string().starts_with("Expected 3 instance storage devices but discovered 0"));
    }

    #[tokio::test]
    async fn test_too_many_devices_is_an_error() {
        let resolver = NvmeInstanceStorageResolver::new(nvme_fs());
        let err = resolver
            .discover_instance_storage(&disks(&["/dev/nvme1n1"]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ResolveError::InstanceStorageMismatch { expected: 1, discovered: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_identity_resolves_each_disk() {
        let resolver = IdentityInstanceStorageResolver::new(Arc::new(IdentityDevicePathResolver::new()));
        let found = resolver
            .discover_instance_storage(&disks(&["/dev/sdb", "/dev/sdc"]))
            .await
            .unwrap();
        assert_eq!(found, vec![PathBuf::from("/dev/sdb"), PathBuf::from("/dev/sdc")]);
    }

    #[tokio::test]
    async fn test_auto_detect_decides_once() {
        let fs = nvme_fs();
        let identity = Arc::new(IdentityInstanceStorageResolver::new(Arc::new(
            IdentityDevicePathResolver::new(),
        )));
        let nvme = Arc::new(NvmeInstanceStorageResolver::new(fs.clone()));
        let resolver = AutoDetectingInstanceStorageResolver::new(identity, nvme);

        let first = resolver
            .discover_instance_storage(&disks(&["/dev/nvme0n1", "/dev/nvme1n1", "/dev/nvme2n1"]))
            .await
            .unwrap();
        assert_eq!(first.len(), 3);

        // Non-NVMe paths would pick the identity strategy on a fresh resolver.
        let second = resolver
            .discover_instance_storage(&disks(&["/dev/sdb", "/dev/sdc", "/dev/sdd"]))
            .await
            .unwrap();
        assert_eq!(second, first);
    }
}
