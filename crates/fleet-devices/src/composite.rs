//! Resolvers that delegate to other strategies in a fixed order.

use crate::DevicePathResolver;
use crate::error::{ResolveError, Result};
use async_trait::async_trait;
use fleet_core::ports::FileSystem;
use fleet_core::settings::DiskSettings;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Tries `primary`, then `secondary` on any primary failure.
pub struct FallbackDevicePathResolver {
    primary: Arc<dyn DevicePathResolver>,
    secondary: Arc<dyn DevicePathResolver>,
}

impl FallbackDevicePathResolver {
    pub fn new(primary: Arc<dyn DevicePathResolver>, secondary: Arc<dyn DevicePathResolver>) -> Self {
        Self { primary, secondary }
    }
}

#[async_trait]
impl DevicePathResolver for FallbackDevicePathResolver {
    async fn get_real_device_path(&self, disk: &DiskSettings) -> Result<PathBuf> {
        let primary = match self.primary.get_real_device_path(disk).await {
            Ok(path) => return Ok(path),
            Err(e) => e,
        };
        debug!(disk_id = %disk.id, error = %primary, "Primary resolver failed, trying fallback");

        self.secondary
            .get_real_device_path(disk)
            .await
            .map_err(|secondary| ResolveError::Fallback {
                primary: Box::new(primary),
                secondary: Box::new(secondary),
            })
    }
}

/// Tries the udev id strategy, then iSCSI. A timeout from the id strategy
/// only means the disk is not addressed that way.
pub struct MultipathDevicePathResolver {
    id: Arc<dyn DevicePathResolver>,
    iscsi: Arc<dyn DevicePathResolver>,
}

impl MultipathDevicePathResolver {
    pub fn new(id: Arc<dyn DevicePathResolver>, iscsi: Arc<dyn DevicePathResolver>) -> Self {
        Self { id, iscsi }
    }
}

#[async_trait]
impl DevicePathResolver for MultipathDevicePathResolver {
    async fn get_real_device_path(&self, disk: &DiskSettings) -> Result<PathBuf> {
        match self.id.get_real_device_path(disk).await {
            Ok(path) => return Ok(path),
            Err(e) => debug!(
                disk_id = %disk.id,
                error = %e,
                timed_out = e.timed_out(),
                "Resolving by id failed, trying iSCSI"
            ),
        }

        self.iscsi
            .get_real_device_path(disk)
            .await
            .map_err(|e| e.context("Resolving iSCSI device path"))
    }
}

/// Tries the udev id strategy, then the `/dev/sdX` remapping.
pub struct VirtioDevicePathResolver {
    id: Arc<dyn DevicePathResolver>,
    mapped: Arc<dyn DevicePathResolver>,
}

impl VirtioDevicePathResolver {
    pub fn new(id: Arc<dyn DevicePathResolver>, mapped: Arc<dyn DevicePathResolver>) -> Self {
        Self { id, mapped }
    }
}

#[async_trait]
impl DevicePathResolver for VirtioDevicePathResolver {
    async fn get_real_device_path(&self, disk: &DiskSettings) -> Result<PathBuf> {
        match self.id.get_real_device_path(disk).await {
            Ok(path) => return Ok(path),
            Err(e) => debug!(
                disk_id = %disk.id,
                error = %e,
                timed_out = e.timed_out(),
                "Resolving by id failed, using mapped resolver"
            ),
        }

        self.mapped
            .get_real_device_path(disk)
            .await
            .map_err(|e| e.context("Resolving mapped device path"))
    }
}

/// Picks a SCSI strategy from the fields the disk carries: device id first,
/// then volume id, then LUN plus host device id.
pub struct ScsiDevicePathResolver {
    id: Arc<dyn DevicePathResolver>,
    volume_id: Arc<dyn DevicePathResolver>,
    lun: Arc<dyn DevicePathResolver>,
}

impl ScsiDevicePathResolver {
    pub fn new(
        id: Arc<dyn DevicePathResolver>,
        volume_id: Arc<dyn DevicePathResolver>,
        lun: Arc<dyn DevicePathResolver>,
    ) -> Self {
        Self { id, volume_id, lun }
    }
}

#[async_trait]
impl DevicePathResolver for ScsiDevicePathResolver {
    async fn get_real_device_path(&self, disk: &DiskSettings) -> Result<PathBuf> {
        if !disk.device_id.is_empty() {
            return self.id.get_real_device_path(disk).await;
        }
        if !disk.volume_id.is_empty() {
            return self.volume_id.get_real_device_path(disk).await;
        }
        if !disk.lun.is_empty() && !disk.host_device_id.is_empty() {
            return self.lun.get_real_device_path(disk).await;
        }
        Err(ResolveError::MissingField(
            "device id, volume id or lun with host device id",
        ))
    }
}

/// Chooses between an NVMe strategy and a default one the first time it is
/// asked, depending on whether the host has NVMe devices at all.
pub struct AutoDetectingDevicePathResolver {
    fs: Arc<dyn FileSystem>,
    nvme: Arc<dyn DevicePathResolver>,
    default: Arc<dyn DevicePathResolver>,
    nvme_pattern: String,
    selected: OnceCell<Arc<dyn DevicePathResolver>>,
}

impl AutoDetectingDevicePathResolver {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        nvme: Arc<dyn DevicePathResolver>,
        default: Arc<dyn DevicePathResolver>,
    ) -> Self {
        Self {
            fs,
            nvme,
            default,
            nvme_pattern: "/dev/nvme*n1".to_string(),
            selected: OnceCell::new(),
        }
    }

    async fn detect(&self) -> Arc<dyn DevicePathResolver> {
        match self.fs.glob(&self.nvme_pattern).await {
            Ok(devices) if !devices.is_empty() => {
                info!(count = devices.len(), "NVMe devices detected");
                self.nvme.clone()
            }
            Ok(_) => self.default.clone(),
            Err(e) => {
                warn!(error = %e, "NVMe detection failed, using default resolver");
                self.default.clone()
            }
        }
    }
}

#[async_trait]
impl DevicePathResolver for AutoDetectingDevicePathResolver {
    async fn get_real_device_path(&self, disk: &DiskSettings) -> Result<PathBuf> {
        let resolver = self.selected.get_or_init(|| self.detect()).await;
        resolver.get_real_device_path(disk).await
    }
}
