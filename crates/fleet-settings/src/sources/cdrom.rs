use crate::contents::parse_settings;
use crate::error::{Result, SettingsError};
use crate::source::SettingsSource;
use async_trait::async_trait;
use fleet_core::ports::Platform;
use fleet_core::settings::Settings;
use std::sync::Arc;

/// Settings from a file on the virtual CD-ROM the infrastructure attaches.
pub struct CdromSettingsSource {
    platform: Arc<dyn Platform>,
    file_name: String,
}

impl CdromSettingsSource {
    pub fn new(platform: Arc<dyn Platform>, file_name: impl Into<String>) -> Self {
        Self {
            platform,
            file_name: file_name.into(),
        }
    }
}

#[async_trait]
impl SettingsSource for CdromSettingsSource {
    async fn public_ssh_key_for_username(&self, _username: &str) -> Result<String> {
        Ok(String::new())
    }

    async fn settings(&self) -> Result<Settings> {
        let raw = self
            .platform
            .get_file_contents_from_cdrom(&self.file_name)
            .await
            .map_err(|e| SettingsError::from(e).context("Reading settings from CDROM"))?;
        parse_settings(&raw, "CDROM settings")
    }

    fn name(&self) -> &'static str {
        "cdrom"
    }
}
