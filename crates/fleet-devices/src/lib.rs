//! Device path resolution for the fleet agent.
//!
//! Turns the disk addressing metadata reported by the infrastructure into
//! the kernel device node that actually backs the disk. Kernel enumeration is
//! asynchronous, so most strategies trigger a rescan once and then poll until
//! a deadline.

pub mod composite;
pub mod error;
pub mod id;
pub mod identity;
pub mod instance_storage;
pub mod iscsi;
pub mod mapped;
pub mod poll;
pub mod scsi;
pub mod symlink;

pub use composite::{
    AutoDetectingDevicePathResolver, FallbackDevicePathResolver, MultipathDevicePathResolver,
    ScsiDevicePathResolver, VirtioDevicePathResolver,
};
pub use error::{ResolveError, Result};
pub use id::IdDevicePathResolver;
pub use identity::IdentityDevicePathResolver;
pub use instance_storage::{
    AutoDetectingInstanceStorageResolver, IdentityInstanceStorageResolver, InstanceStorageResolver,
    NvmeInstanceStorageResolver,
};
pub use iscsi::IscsiDevicePathResolver;
pub use mapped::MappedDevicePathResolver;
pub use poll::PollSettings;
pub use scsi::{ScsiIdDevicePathResolver, ScsiLunDevicePathResolver, ScsiVolumeIdDevicePathResolver};
pub use symlink::SymlinkDevicePathResolver;

use async_trait::async_trait;
use fleet_core::ports::{CommandRunner, FileSystem};
use fleet_core::settings::DiskSettings;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// Strategy mapping a disk descriptor to the device node backing it.
#[async_trait]
pub trait DevicePathResolver: Send + Sync {
    /// Resolve the device path. Use [`ResolveError::timed_out`] to tell a
    /// device that never appeared from unusable input.
    async fn get_real_device_path(&self, disk: &DiskSettings) -> Result<PathBuf>;
}

/// How disks are addressed on this infrastructure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceResolution {
    /// Trust the reported path, remapping `/dev/sdX` when needed.
    #[default]
    Mapped,
    Virtio,
    Scsi,
    Iscsi,
    /// NVMe managed volumes when the host has NVMe devices, otherwise mapped.
    Nvme,
    Identity,
}

impl DeviceResolution {
    /// Build the resolver chain for this addressing scheme.
    pub fn build(
        self,
        fs: Arc<dyn FileSystem>,
        runner: Arc<dyn CommandRunner>,
        poll: PollSettings,
    ) -> Arc<dyn DevicePathResolver> {
        let id: Arc<dyn DevicePathResolver> =
            Arc::new(IdDevicePathResolver::new(fs.clone(), runner.clone(), poll));
        let mapped: Arc<dyn DevicePathResolver> =
            Arc::new(MappedDevicePathResolver::new(fs.clone(), poll));

        match self {
            DeviceResolution::Identity => Arc::new(IdentityDevicePathResolver::new()),
            DeviceResolution::Mapped => mapped,
            DeviceResolution::Virtio => Arc::new(VirtioDevicePathResolver::new(id, mapped)),
            DeviceResolution::Scsi => Arc::new(ScsiDevicePathResolver::new(
                Arc::new(ScsiIdDevicePathResolver::new(fs.clone(), poll)),
                Arc::new(ScsiVolumeIdDevicePathResolver::new(fs.clone(), poll)),
                Arc::new(ScsiLunDevicePathResolver::new(fs, poll)),
            )),
            DeviceResolution::Iscsi => Arc::new(MultipathDevicePathResolver::new(
                id,
                Arc::new(IscsiDevicePathResolver::new(fs, runner, poll)),
            )),
            DeviceResolution::Nvme => {
                let nvme: Arc<dyn DevicePathResolver> = Arc::new(FallbackDevicePathResolver::new(
                    Arc::new(SymlinkDevicePathResolver::new(fs.clone(), runner, poll)),
                    mapped.clone(),
                ));
                Arc::new(AutoDetectingDevicePathResolver::new(fs, nvme, mapped))
            }
        }
    }
}
