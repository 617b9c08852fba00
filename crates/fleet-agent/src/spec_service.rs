use async_trait::async_trait;
use fleet_core::ports::{FileSystem, JobSpec, SpecService};
use fleet_core::{Error, Result};
use std::path::PathBuf;
use std::sync::Arc;

/// Reads the applied job spec from a JSON file. A VM with no file has no job.
pub struct FileSpecService {
    fs: Arc<dyn FileSystem>,
    path: PathBuf,
}

impl FileSpecService {
    pub fn new(fs: Arc<dyn FileSystem>, path: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            path: path.into(),
        }
    }
}

#[async_trait]
impl SpecService for FileSpecService {
    async fn get(&self) -> Result<JobSpec> {
        if !self.fs.exists(&self.path).await {
            return Ok(JobSpec::default());
        }

        let raw = self.fs.read_file(&self.path).await?;
        serde_json::from_slice(&raw).map_err(|e| {
            Error::Serialization(format!("Unmarshalling job spec {}: {}", self.path.display(), e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::fakes::FakeFileSystem;

    #[tokio::test]
    async fn test_missing_spec_is_empty() {
        let service = FileSpecService::new(FakeFileSystem::new(), "/state/spec.json");
        assert_eq!(service.get().await.unwrap(), JobSpec::default());
    }

    #[tokio::test]
    async fn test_reads_spec() {
        let fs = FakeFileSystem::new();
        fs.set_file(
            "/state/spec.json",
            r#"{"deployment":"cf","job_name":"router","index":2,"node_id":"abc"}"#,
        );
        let spec = FileSpecService::new(fs, "/state/spec.json").get().await.unwrap();

        assert_eq!(spec.deployment, "cf");
        assert_eq!(spec.job_name.as_deref(), Some("router"));
        assert_eq!(spec.index, Some(2));
    }

    #[tokio::test]
    async fn test_corrupt_spec_is_an_error() {
        let fs = FakeFileSystem::new();
        fs.set_file("/state/spec.json", "{");
        assert!(FileSpecService::new(fs, "/state/spec.json").get().await.is_err());
    }
}
