use crate::error::Result;
use crate::metadata::MetadataService;
use crate::source::SettingsSource;
use async_trait::async_trait;
use fleet_core::settings::Settings;
use std::sync::Arc;

/// Settings and keys served by a metadata service.
pub struct ComplexSettingsSource {
    metadata: Arc<dyn MetadataService>,
}

impl ComplexSettingsSource {
    pub fn new(metadata: Arc<dyn MetadataService>) -> Self {
        Self { metadata }
    }
}

#[async_trait]
impl SettingsSource for ComplexSettingsSource {
    async fn public_ssh_key_for_username(&self, _username: &str) -> Result<String> {
        self.metadata.get_public_key().await
    }

    async fn settings(&self) -> Result<Settings> {
        self.metadata
            .get_settings()
            .await
            .map_err(|e| e.context("Getting settings from metadata service"))
    }

    fn name(&self) -> &'static str {
        "metadata"
    }
}
