use super::MetadataService;
use crate::error::{Result, SettingsError};
use async_trait::async_trait;
use fleet_core::ports::FileSystem;
use fleet_core::settings::{Networks, Settings};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

const SERVER_NAME_FILE: &str = "server_name.json";
const REGISTRY_ENDPOINT_FILE: &str = "registry_endpoint.json";

/// Keeps the server name and registry endpoint on disk so they survive a
/// metadata endpoint outage.
///
/// Entries never expire. A cache file that cannot be read or parsed is
/// deleted and replaced by a live fetch. Failing to write the fresh value
/// is reported to the caller.
pub struct CachingMetadataService {
    inner: Arc<dyn MetadataService>,
    fs: Arc<dyn FileSystem>,
    cache_dir: PathBuf,
}

impl CachingMetadataService {
    pub fn new(inner: Arc<dyn MetadataService>, fs: Arc<dyn FileSystem>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            fs,
            cache_dir: cache_dir.into(),
        }
    }

    async fn read_cache(&self, path: &Path) -> Option<String> {
        let raw = match self.fs.read_file(path).await {
            Ok(raw) => raw,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Metadata cache miss");
                self.discard(path).await;
                return None;
            }
        };

        match serde_json::from_slice::<String>(&raw) {
            Ok(value) if !value.is_empty() => Some(value),
            Ok(_) => {
                self.discard(path).await;
                None
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Discarding corrupt metadata cache");
                self.discard(path).await;
                None
            }
        }
    }

    async fn discard(&self, path: &Path) {
        if let Err(e) = self.fs.remove_file(path).await {
            warn!(path = %path.display(), error = %e, "Removing metadata cache file");
        }
    }

    async fn write_cache(&self, path: &Path, value: &str) -> Result<()> {
        let raw = serde_json::to_vec(value).map_err(|e| SettingsError::parse("metadata cache", e))?;
        self.fs
            .write_file(path, &raw)
            .await
            .map_err(|e| SettingsError::from(e).context(format!("Caching metadata to {}", path.display())))
    }
}

#[async_trait]
impl MetadataService for CachingMetadataService {
    async fn get_public_key(&self) -> Result<String> {
        self.inner.get_public_key().await
    }

    async fn get_instance_id(&self) -> Result<String> {
        self.inner.get_instance_id().await
    }

    async fn get_server_name(&self) -> Result<String> {
        let path = self.cache_dir.join(SERVER_NAME_FILE);
        if let Some(cached) = self.read_cache(&path).await {
            return Ok(cached);
        }
        let name = self.inner.get_server_name().await?;
        self.write_cache(&path, &name).await?;
        Ok(name)
    }

    async fn get_registry_endpoint(&self) -> Result<String> {
        let path = self.cache_dir.join(REGISTRY_ENDPOINT_FILE);
        if let Some(cached) = self.read_cache(&path).await {
            return Ok(cached);
        }
        let endpoint = self.inner.get_registry_endpoint().await?;
        self.write_cache(&path, &endpoint).await?;
        Ok(endpoint)
    }

    async fn get_networks(&self) -> Result<Networks> {
        self.inner.get_networks().await
    }

    async fn get_settings(&self) -> Result<Settings> {
        self.inner.get_settings().await
    }

    async fn is_available(&self) -> bool {
        self.inner.is_available().await
    }
}
