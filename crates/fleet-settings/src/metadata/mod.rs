//! Readers of provider-supplied instance metadata.

pub mod caching;
pub mod client;
pub mod file;
pub mod http;
pub mod multi;

pub use caching::CachingMetadataService;
pub use client::{MetadataClient, RetryPolicy};
pub use http::MetadataPaths;
pub use file::FileMetadataService;
pub use http::HttpMetadataService;
pub use multi::MultiSourceMetadataService;

use crate::error::Result;
use async_trait::async_trait;
use fleet_core::settings::{Networks, Settings};

#[async_trait]
pub trait MetadataService: Send + Sync {
    async fn get_public_key(&self) -> Result<String>;

    async fn get_instance_id(&self) -> Result<String>;

    async fn get_server_name(&self) -> Result<String>;

    async fn get_registry_endpoint(&self) -> Result<String>;

    async fn get_networks(&self) -> Result<Networks>;

    async fn get_settings(&self) -> Result<Settings>;

    /// Cheap probe used to pick among several services.
    async fn is_available(&self) -> bool;
}
