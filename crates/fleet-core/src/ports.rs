//! Port traits (hexagonal architecture).
//!
//! These traits define the collaborators the agent core consumes: host
//! filesystem and process access, OS platform operations, the message bus,
//! and the job supervisor.

use crate::Result;
use crate::events::{JobFailure, Vitals};
use crate::message::{Request, Response};
use crate::settings::{DiskSettings, Networks};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Filesystem access used by resolvers, metadata caches, and task persistence.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Read the whole file.
    async fn read_file(&self, path: &Path) -> Result<Vec<u8>>;

    /// Write the whole file, creating parent directories as needed.
    async fn write_file(&self, path: &Path, contents: &[u8]) -> Result<()>;

    /// Remove a file. Removing a missing file is not an error.
    async fn remove_file(&self, path: &Path) -> Result<()>;

    /// Atomically replace `to` with `from`.
    async fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Whether the path exists, following symlinks.
    async fn exists(&self, path: &Path) -> bool;

    /// Expand a glob pattern into matching paths, sorted.
    async fn glob(&self, pattern: &str) -> Result<Vec<PathBuf>>;

    /// Fully resolve every symlink in `path`, including intermediate and
    /// relative links.
    async fn canonicalize(&self, path: &Path) -> Result<PathBuf>;

    async fn read_file_string(&self, path: &Path) -> Result<String> {
        let bytes = self.read_file(path).await?;
        String::from_utf8(bytes)
            .map_err(|e| crate::Error::Serialization(format!("{}: {}", path.display(), e)))
    }
}

/// Captured output of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Runs external programs.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a program to completion. A non-zero exit status is an error.
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;
}

/// OS platform operations.
#[async_trait]
pub trait Platform: Send + Sync {
    fn fs(&self) -> Arc<dyn FileSystem>;

    fn runner(&self) -> Arc<dyn CommandRunner>;

    async fn setup_networking(&self, networks: &Networks) -> Result<()>;

    async fn get_configured_network_interfaces(&self) -> Result<Vec<String>>;

    async fn get_file_contents_from_cdrom(&self, file_name: &str) -> Result<Vec<u8>>;

    /// Mount `disk_path` and read each of `file_names` relative to its root.
    async fn get_files_contents_from_disk(
        &self,
        disk_path: &Path,
        file_names: &[&str],
    ) -> Result<Vec<Vec<u8>>>;

    /// Best guess of the device path for a disk before any resolution.
    fn normalize_disk_path(&self, disk: &DiskSettings) -> PathBuf;

    async fn vitals(&self) -> Result<Vitals>;
}

/// Function invoked by the bus for every inbound request.
pub type DispatchFn = Arc<dyn Fn(Request) -> BoxFuture<'static, Response> + Send + Sync>;

/// Inbound and outbound message bus.
#[async_trait]
pub trait MessageBusHandler: Send + Sync {
    /// Deliver inbound requests to `dispatch` until the transport fails.
    async fn run(&self, dispatch: DispatchFn) -> Result<()>;

    /// Publish a message to `target` under `topic`.
    async fn send(&self, target: &str, topic: &str, message: serde_json::Value) -> Result<()>;
}

/// Function invoked for every monitored-process failure.
pub type JobFailureHandler =
    Arc<dyn Fn(JobFailure) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Process supervisor for the jobs running on this VM.
#[async_trait]
pub trait JobSupervisor: Send + Sync {
    /// Aggregate job state, e.g. `running` or `failing`.
    async fn status(&self) -> String;

    /// Record the current health status for the supervisor's own reporting.
    async fn health_recorder(&self, status: &str);

    /// Block, forwarding each failure to `handler`.
    async fn monitor_job_failures(&self, handler: JobFailureHandler) -> Result<()>;
}

/// Identity of the job currently applied to this VM.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(default)]
    pub deployment: String,
    #[serde(default)]
    pub job_name: Option<String>,
    #[serde(default)]
    pub index: Option<u32>,
    #[serde(default)]
    pub node_id: String,
}

/// Access to the currently applied job spec.
#[async_trait]
pub trait SpecService: Send + Sync {
    async fn get(&self) -> Result<JobSpec>;
}
