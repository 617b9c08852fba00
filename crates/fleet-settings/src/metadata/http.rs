use super::MetadataService;
use super::client::MetadataClient;
use crate::contents::UserDataContents;
use crate::error::{Result, SettingsError};
use async_trait::async_trait;
use fleet_core::settings::{Networks, Settings};

/// Paths of the values served by an EC2-style metadata endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataPaths {
    pub user_data: String,
    pub instance_id: String,
    pub ssh_keys: String,
}

impl Default for MetadataPaths {
    fn default() -> Self {
        Self {
            user_data: "/latest/user-data".to_string(),
            instance_id: "/latest/meta-data/instance-id".to_string(),
            ssh_keys: "/latest/meta-data/public-keys/0/openssh-key".to_string(),
        }
    }
}

/// Metadata read from an HTTP endpoint.
pub struct HttpMetadataService {
    client: MetadataClient,
    paths: MetadataPaths,
}

impl HttpMetadataService {
    pub fn new(client: MetadataClient, paths: MetadataPaths) -> Self {
        Self { client, paths }
    }

    async fn user_data(&self) -> Result<UserDataContents> {
        let raw = self
            .client
            .get(&self.paths.user_data)
            .await
            .map_err(|e| e.context("Getting user data"))?;
        UserDataContents::from_slice(&raw)
    }

    async fn get_text(&self, path: &str, what: &str) -> Result<String> {
        let raw = self
            .client
            .get(path)
            .await
            .map_err(|e| e.context(format!("Getting {}", what)))?;
        Ok(String::from_utf8_lossy(&raw).trim().to_string())
    }
}

#[async_trait]
impl MetadataService for HttpMetadataService {
    async fn get_public_key(&self) -> Result<String> {
        if self.paths.ssh_keys.is_empty() {
            return Ok(String::new());
        }
        self.get_text(&self.paths.ssh_keys, "public key").await
    }

    async fn get_instance_id(&self) -> Result<String> {
        if self.paths.instance_id.is_empty() {
            return Ok(String::new());
        }
        self.get_text(&self.paths.instance_id, "instance id").await
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
        self.user_data().await?.resolved_settings()
    }

    async fn is_available(&self) -> bool {
        true
    }
}
