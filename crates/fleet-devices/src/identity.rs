use crate::DevicePathResolver;
use crate::error::{ResolveError, Result};
use async_trait::async_trait;
use fleet_core::settings::DiskSettings;
use std::path::PathBuf;

/// Trusts the path the infrastructure reported.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityDevicePathResolver;

impl IdentityDevicePathResolver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DevicePathResolver for IdentityDevicePathResolver {
    async fn get_real_device_path(&self, disk: &DiskSettings) -> Result<PathBuf> {
        if disk.path.is_empty() {
            return Err(ResolveError::MissingField("path"));
        }
        Ok(PathBuf::from(&disk.path))
    }
}
