//! Maps the disks named in the settings to kernel device paths.

use fleet_core::ports::{CommandRunner, FileSystem};
use fleet_core::settings::{DiskSettings, Settings};
use fleet_devices::{
    AutoDetectingInstanceStorageResolver, DevicePathResolver, DeviceResolution,
    IdentityInstanceStorageResolver, InstanceStorageResolver, NvmeInstanceStorageResolver,
    PollSettings, ResolveError,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Device paths found for each configured disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskReport {
    pub ephemeral: Option<PathBuf>,
    pub persistent: BTreeMap<String, PathBuf>,
    pub instance_storage: Vec<PathBuf>,
}

pub struct DiskInventory {
    resolver: Arc<dyn DevicePathResolver>,
    instance_storage: Arc<dyn InstanceStorageResolver>,
}

impl DiskInventory {
    pub fn new(
        resolver: Arc<dyn DevicePathResolver>,
        instance_storage: Arc<dyn InstanceStorageResolver>,
    ) -> Self {
        Self {
            resolver,
            instance_storage,
        }
    }

    /// Wire the resolvers for an addressing scheme.
    pub fn for_resolution(
        resolution: DeviceResolution,
        fs: Arc<dyn FileSystem>,
        runner: Arc<dyn CommandRunner>,
        poll: PollSettings,
    ) -> Self {
        let resolver = resolution.build(Arc::clone(&fs), runner, poll);
        let identity: Arc<dyn InstanceStorageResolver> =
            Arc::new(IdentityInstanceStorageResolver::new(Arc::clone(&resolver)));

        let instance_storage: Arc<dyn InstanceStorageResolver> = match resolution {
            DeviceResolution::Nvme => Arc::new(AutoDetectingInstanceStorageResolver::new(
                identity,
                Arc::new(NvmeInstanceStorageResolver::new(fs)),
            )),
            _ => identity,
        };

        Self::new(resolver, instance_storage)
    }

    pub async fn discover(&self, settings: &Settings) -> Result<DiskReport, ResolveError> {
        let mut report = DiskReport::default();

        let ephemeral = settings.ephemeral_disk_settings();
        if is_addressable(&ephemeral) {
            let path = self
                .resolver
                .get_real_device_path(&ephemeral)
                .await
                .map_err(|e| e.context("Resolving ephemeral disk"))?;
            info!(device = %path.display(), "Found ephemeral disk");
            report.ephemeral = Some(path);
        }

        for disk in settings.persistent_disks() {
            let path = self
                .resolver
                .get_real_device_path(&disk)
                .await
                .map_err(|e| e.context(format!("Resolving persistent disk '{}'", disk.id)))?;
            info!(disk_id = %disk.id, device = %path.display(), "Found persistent disk");
            report.persistent.insert(disk.id, path);
        }

        let raw = settings.raw_ephemeral_disk_settings();
        if !raw.is_empty() {
            report.instance_storage = self
                .instance_storage
                .discover_instance_storage(&raw)
                .await
                .map_err(|e| e.context("Discovering instance storage"))?;
            info!(devices = ?report.instance_storage, "Found instance storage");
        }

        Ok(report)
    }
}

fn is_addressable(disk: &DiskSettings) -> bool {
    !(disk.path.is_empty()
        && disk.volume_id.is_empty()
        && disk.device_id.is_empty()
        && disk.lun.is_empty()
        && disk.iscsi.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::fakes::{FakeCommandRunner, FakeFileSystem};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn settings(raw: serde_json::Value) -> Settings {
        serde_json::from_value(raw).unwrap()
    }

    #[tokio::test]
    async fn test_no_disks() {
        let inventory = DiskInventory::for_resolution(
            DeviceResolution::Identity,
            FakeFileSystem::new(),
            FakeCommandRunner::new(),
            PollSettings::default(),
        );
        let report = inventory
            .discover(&settings(serde_json::json!({"agent_id": "a"})))
            .await
            .unwrap();
        assert_eq!(report, DiskReport::default());
    }

    #[tokio::test]
    async fn test_identity_resolution() {
        let inventory = DiskInventory::for_resolution(
            DeviceResolution::Identity,
            FakeFileSystem::new(),
            FakeCommandRunner::new(),
            PollSettings::default(),
        );
        let report = inventory
            .discover(&settings(serde_json::json!({
                "agent_id": "a",
                "disks": {
                    "ephemeral": "/dev/sdb",
                    "persistent": {"vol-1": "/dev/sdc"},
                    "raw_ephemeral": [{"id": "r1", "path": "/dev/nvme1n1"}]
                }
            })))
            .await
            .unwrap();

        assert_eq!(report.ephemeral, Some(PathBuf::from("/dev/sdb")));
        assert_eq!(report.persistent["vol-1"], PathBuf::from("/dev/sdc"));
        assert_eq!(report.instance_storage, vec![PathBuf::from("/dev/nvme1n1")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_persistent_disk_names_the_disk() {
        let inventory = DiskInventory::for_resolution(
            DeviceResolution::Mapped,
            FakeFileSystem::new(),
            FakeCommandRunner::new(),
            PollSettings::new(Duration::from_secs(1)),
        );
        let err = inventory
            .discover(&settings(serde_json::json!({
                "agent_id": "a",
                "disks": {"persistent": {"vol-1": "/dev/sdc"}}
            })))
            .await
            .unwrap_err();

        assert!(err.timed_out());
        assert!(err.to_string().contains("Resolving persistent disk 'vol-1'"));
    }
}
