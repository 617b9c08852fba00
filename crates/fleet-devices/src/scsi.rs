//! SCSI-attached disk strategies: by disk id, by target (volume) id and by
//! LUN on a specific vmbus host adapter.

use crate::DevicePathResolver;
use crate::error::{ResolveError, Result};
use crate::poll::{
    PollSettings, dev_path_for_block_entry, existing_target, poll_until, rescan_scsi_hosts,
    single_match,
};
use async_trait::async_trait;
use fleet_core::ports::FileSystem;
use fleet_core::settings::DiskSettings;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

const SCSI_HOST_SCAN_PATTERN: &str = "/sys/class/scsi_host/host*/scan";
const SCSI_DEVICES_DIR: &str = "/sys/bus/scsi/devices";
const ROOT_DISK_NAME: &str = "sda";

/// SCSI address (`host:channel:target:lun`) of a sysfs block entry such as
/// `/sys/bus/scsi/devices/2:0:3:0/block/sdf`.
fn scsi_address(entry: &Path) -> Option<&str> {
    entry
        .strip_prefix(SCSI_DEVICES_DIR)
        .ok()?
        .components()
        .next()?
        .as_os_str()
        .to_str()
}

fn scsi_host(entry: &Path) -> Option<&str> {
    scsi_address(entry)?.split(':').next()
}

/// Finds a disk by its identifier in the udev `by-id` tree after rescanning
/// every SCSI host.
pub struct ScsiIdDevicePathResolver {
    fs: Arc<dyn FileSystem>,
    poll: PollSettings,
}

impl ScsiIdDevicePathResolver {
    pub fn new(fs: Arc<dyn FileSystem>, poll: PollSettings) -> Self {
        Self { fs, poll }
    }
}

#[async_trait]
impl DevicePathResolver for ScsiIdDevicePathResolver {
    async fn get_real_device_path(&self, disk: &DiskSettings) -> Result<PathBuf> {
        if disk.device_id.is_empty() {
            return Err(ResolveError::MissingField("device id"));
        }

        let fs = self.fs.as_ref();
        rescan_scsi_hosts(fs, SCSI_HOST_SCAN_PATTERN).await?;

        let id = disk.device_id.replace('-', "").to_lowercase();
        let pattern = format!("/dev/disk/by-id/*{}", id);

        poll_until(self.poll, &disk.device_id, || {
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

/// Finds a disk by its SCSI target number on the root disk's host adapter.
pub struct ScsiVolumeIdDevicePathResolver {
    fs: Arc<dyn FileSystem>,
    poll: PollSettings,
}

impl ScsiVolumeIdDevicePathResolver {
    pub fn new(fs: Arc<dyn FileSystem>, poll: PollSettings) -> Self {
        Self { fs, poll }
    }

    /// Host adapter number of the root disk, when it sits on SCSI target 0.
    async fn root_disk_host(&self) -> Option<String> {
        let pattern = format!("{}/*:0:0:0/block/*", SCSI_DEVICES_DIR);
        let entries = match self.fs.glob(&pattern).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!(error = %e, "Listing root disk SCSI entries");
                return None;
            }
        };

        entries
            .iter()
            .find(|entry| entry.file_name().is_some_and(|name| name == ROOT_DISK_NAME))
            .and_then(|entry| scsi_host(entry))
            .map(String::from)
    }
}

#[async_trait]
impl DevicePathResolver for ScsiVolumeIdDevicePathResolver {
    async fn get_real_device_path(&self, disk: &DiskSettings) -> Result<PathBuf> {
        if disk.volume_id.is_empty() {
            return Err(ResolveError::MissingField("volume id"));
        }

        let fs = self.fs.as_ref();
        let host = match self.root_disk_host().await {
            Some(host) => {
                let scan = PathBuf::from(format!("/sys/class/scsi_host/host{}/scan", host));
                fs.write_file(&scan, b"- - -")
                    .await
                    .map_err(|e| ResolveError::from(e).context("Rescanning SCSI host"))?;
                host
            }
            None => {
                warn!("Root disk SCSI host not found, rescanning all hosts");
                rescan_scsi_hosts(fs, SCSI_HOST_SCAN_PATTERN).await?;
                "*".to_string()
            }
        };

        let pattern = format!("{}/{}:0:{}:0/block/*", SCSI_DEVICES_DIR, host, disk.volume_id);
        debug!(volume_id = %disk.volume_id, %pattern, "Resolving device path by volume id");

        poll_until(self.poll, &disk.volume_id, || {
            let pattern = &pattern;
            async move {
                Ok(single_match(fs, pattern)
                    .await?
                    .and_then(|entry| dev_path_for_block_entry(&entry)))
            }
        })
        .await
    }
}

/// Finds a disk by LUN, restricted to the vmbus host adapter whose device id
/// matches the one the infrastructure reported.
pub struct ScsiLunDevicePathResolver {
    fs: Arc<dyn FileSystem>,
    poll: PollSettings,
}

impl ScsiLunDevicePathResolver {
    pub fn new(fs: Arc<dyn FileSystem>, poll: PollSettings) -> Self {
        Self { fs, poll }
    }

    fn normalize_device_id(id: &str) -> String {
        id.trim()
            .trim_start_matches('{')
            .trim_end_matches('}')
            .to_lowercase()
    }

    async fn host_device_id(&self, host: &str) -> Option<String> {
        let path = PathBuf::from(format!("/sys/class/scsi_host/host{}/device/../device_id", host));
        match self.fs.read_file_string(&path).await {
            Ok(contents) => Some(Self::normalize_device_id(&contents)),
            Err(e) => {
                debug!(host, error = %e, "Reading host adapter device id");
                None
            }
        }
    }

    async fn find(&self, pattern: &str, wanted_host_device_id: &str) -> Result<Option<PathBuf>> {
        let entries = match self.fs.glob(pattern).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!(pattern, error = %e, "Glob failed, retrying");
                return Ok(None);
            }
        };

        let mut matches = Vec::new();
        for entry in entries {
            let Some(host) = scsi_host(&entry) else {
                continue;
            };
            if self.host_device_id(host).await.as_deref() == Some(wanted_host_device_id) {
                matches.extend(dev_path_for_block_entry(&entry));
            }
        }

        match matches.len() {
            0 => Ok(None),
            1 => Ok(matches.pop()),
            _ => Err(ResolveError::Ambiguous {
                pattern: pattern.to_string(),
                matches: matches.iter().map(|p| p.display().to_string()).collect(),
            }),
        }
    }
}

#[async_trait]
impl DevicePathResolver for ScsiLunDevicePathResolver {
    async fn get_real_device_path(&self, disk: &DiskSettings) -> Result<PathBuf> {
        if disk.lun.is_empty() {
            return Err(ResolveError::MissingField("lun"));
        }
        if disk.host_device_id.is_empty() {
            return Err(ResolveError::MissingField("host device id"));
        }
        if disk.lun.parse::<u32>().is_err() {
            return Err(ResolveError::InvalidField(format!("lun '{}' is not a number", disk.lun)));
        }

        rescan_scsi_hosts(self.fs.as_ref(), SCSI_HOST_SCAN_PATTERN).await?;

        let pattern = format!("{}/*:*:*:{}/block/*", SCSI_DEVICES_DIR, disk.lun);
        let wanted = Self::normalize_device_id(&disk.host_device_id);
        let subject = format!("lun {} on {}", disk.lun, disk.host_device_id);

        poll_until(self.poll, &subject, || self.find(&pattern, &wanted)).await
    }
}
