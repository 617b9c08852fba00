use super::MetadataService;
use crate::error::{Result, SettingsError};
use async_trait::async_trait;
use fleet_core::settings::{Networks, Settings};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

/// Delegates to the first service that reports itself available. The choice
/// is made on first use and kept for the lifetime of the instance.
pub struct MultiSourceMetadataService {
    services: Vec<Arc<dyn MetadataService>>,
    selected: OnceCell<Arc<dyn MetadataService>>,
}

impl MultiSourceMetadataService {
    pub fn new(services: Vec<Arc<dyn MetadataService>>) -> Self {
        Self {
            services,
            selected: OnceCell::new(),
        }
    }

    async fn selected(&self) -> Result<&Arc<dyn MetadataService>> {
        self.selected
            .get_or_try_init(|| async {
                for (index, service) in self.services.iter().enumerate() {
                    if service.is_available().await {
                        info!(index, "Selected metadata service");
                        return Ok(service.clone());
                    }
                }
                Err(SettingsError::NoServiceAvailable)
            })
            .await
    }
}

#[async_trait]
impl MetadataService for MultiSourceMetadataService {
    async fn get_public_key(&self) -> Result<String> {
        self.selected().await?.get_public_key().await
    }

    async fn get_instance_id(&self) -> Result<String> {
        self.selected().await?.get_instance_id().await
    }

    async fn get_server_name(&self) -> Result<String> {
        self.selected().await?.get_server_name().await
    }

    async fn get_registry_endpoint(&self) -> Result<String> {
        self.selected().await?.get_registry_endpoint().await
    }

    async fn get_networks(&self) -> Result<Networks> {
        self.selected().await?.get_networks().await
    }

    async fn get_settings(&self) -> Result<Settings> {
        self.selected().await?.get_settings().await
    }

    async fn is_available(&self) -> bool {
        for service in &self.services {
            if service.is_available().await {
                return true;
            }
        }
        false
    }
}
