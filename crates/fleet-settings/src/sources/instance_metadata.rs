use crate::contents::parse_settings;
use crate::error::Result;
use crate::metadata::MetadataClient;
use crate::source::SettingsSource;
use async_trait::async_trait;
use fleet_core::settings::Settings;

/// Settings published as a single instance metadata attribute, as on
/// clouds where the metadata server takes a flavor header.
pub struct InstanceMetadataSettingsSource {
    client: MetadataClient,
    settings_path: String,
}

impl InstanceMetadataSettingsSource {
    pub fn new(client: MetadataClient, settings_path: impl Into<String>) -> Self {
        Self {
            client,
            settings_path: settings_path.into(),
        }
    }
}

#[async_trait]
impl SettingsSource for InstanceMetadataSettingsSource {
    async fn public_ssh_key_for_username(&self, _username: &str) -> Result<String> {
        Ok(String::new())
    }

    async fn settings(&self) -> Result<Settings> {
        let raw = self
            .client
            .get(&self.settings_path)
            .await
            .map_err(|e| e.context("Getting settings from instance metadata"))?;
        parse_settings(&raw, "instance metadata settings")
    }

    fn name(&self) -> &'static str {
        "instance-metadata"
    }
}
