use super::MetadataService;
use crate::contents::{MetadataContents, UserDataContents, parse_settings};
use crate::error::{Result, SettingsError};
use async_trait::async_trait;
use fleet_core::ports::FileSystem;
use fleet_core::settings::{Networks, Settings};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Metadata dropped onto the local disk by the provisioning tooling.
pub struct FileMetadataService {
    fs: Arc<dyn FileSystem>,
    meta_data_path: PathBuf,
    user_data_path: PathBuf,
    settings_path: PathBuf,
}

impl FileMetadataService {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        meta_data_path: impl Into<PathBuf>,
        user_data_path: impl Into<PathBuf>,
        settings_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            fs,
            meta_data_path: meta_data_path.into(),
            user_data_path: user_data_path.into(),
            settings_path: settings_path.into(),
        }
    }

    async fn read(&self, path: &Path, what: &str) -> Result<Vec<u8>> {
        self.fs
            .read_file(path)
            .await
            .map_err(|e| SettingsError::from(e).context(format!("Reading {} file", what)))
    }

    async fn metadata(&self) -> Result<MetadataContents> {
        MetadataContents::from_slice(&self.read(&self.meta_data_path, "metadata").await?)
    }

    async fn user_data(&self) -> Result<UserDataContents> {
        UserDataContents::from_slice(&self.read(&self.user_data_path, "user data").await?)
    }
}

#[async_trait]
impl MetadataService for FileMetadataService {
    async fn get_public_key(&self) -> Result<String> {
        Ok(self.metadata().await?.public_key())
    }

    async fn get_instance_id(&self) -> Result<String> {
        Ok(self.metadata().await?.instance_id)
    }

    async fn get_server_name(&self) -> Result<String> {
        let name = self.user_data().await?.server.name;
        if name.is_empty() {
            return Err(SettingsError::Missing("Empty server name".to_string()));
        }
        Ok(name)
    }

    async fn get_registry_endpoint(&self) -> Result<String> {
        let endpoint = self.user_data().await?.registry.endpoint;
        if endpoint.is_empty() {
            return Err(SettingsError::Missing("Empty registry endpoint".to_string()));
        }
        Ok(endpoint)
    }

    async fn get_networks(&self) -> Result<Networks> {
        Ok(self.user_data().await?.networks)
    }

    async fn get_settings(&self) -> Result<Settings> {
        let raw = self.read(&self.settings_path, "settings").await?;
        parse_settings(&raw, "settings file")
    }

    async fn is_available(&self) -> bool {
        self.fs.exists(&self.settings_path).await
    }
}
