//! Durable records of persistent tasks that have not finished yet.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use fleet_core::ports::FileSystem;
use fleet_core::{Error, Result, TaskId};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// What is needed to resume a persistent task after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: TaskId,
    pub method: String,
    #[serde(serialize_with = "to_base64", deserialize_with = "from_base64")]
    pub payload: Vec<u8>,
}

fn to_base64<S: Serializer>(bytes: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(bytes))
}

fn from_base64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    STANDARD.decode(encoded).map_err(serde::de::Error::custom)
}

/// Store of outstanding persistent tasks.
#[async_trait]
pub trait TaskManager: Send + Sync {
    async fn get_infos(&self) -> Result<Vec<TaskInfo>>;

    /// Record a task, replacing any record with the same id.
    async fn add_info(&self, info: TaskInfo) -> Result<()>;

    /// Forget a task. Unknown ids are ignored.
    async fn remove_info(&self, task_id: &TaskId) -> Result<()>;
}

/// Keeps every record in a single JSON file.
///
/// Each change rewrites the whole file through a temporary sibling and a
/// rename, so a crash leaves either the old or the new list on disk.
pub struct FileTaskManager {
    fs: Arc<dyn FileSystem>,
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileTaskManager {
    pub fn new(fs: Arc<dyn FileSystem>, path: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<Vec<TaskInfo>> {
        if !self.fs.exists(&self.path).await {
            return Ok(Vec::new());
        }

        let raw = self.fs.read_file(&self.path).await?;
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&raw).map_err(|e| {
            Error::Persistence(format!("Unmarshalling {}: {}", self.path.display(), e))
        })
    }

    async fn store(&self, infos: &[TaskInfo]) -> Result<()> {
        let raw = serde_json::to_vec(infos)?;
        let tmp = temp_path(&self.path);

        self.fs
            .write_file(&tmp, &raw)
            .await
            .map_err(|e| Error::Persistence(format!("Writing {}: {}", tmp.display(), e)))?;
        self.fs
            .rename(&tmp, &self.path)
            .await
            .map_err(|e| Error::Persistence(format!("Renaming {}: {}", tmp.display(), e)))
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[async_trait]
impl TaskManager for FileTaskManager {
    async fn get_infos(&self) -> Result<Vec<TaskInfo>> {
        let _guard = self.lock.lock().await;
        self.load().await
    }

    async fn add_info(&self, info: TaskInfo) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut infos = self.load().await?;

        infos.retain(|existing| existing.task_id != info.task_id);
        debug!(task_id = %info.task_id, method = %info.method, "Persisting task");
        infos.push(info);

        self.store(&infos).await
    }

    async fn remove_info(&self, task_id: &TaskId) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut infos = self.load().await?;

        let before = infos.len();
        infos.retain(|existing| &existing.task_id != task_id);
        if infos.len() == before {
            return Ok(());
        }

        debug!(task_id = %task_id, "Removing persisted task");
        self.store(&infos).await
    }
}

/// Non-durable task manager.
#[derive(Default)]
pub struct InMemoryTaskManager {
    infos: Mutex<Vec<TaskInfo>>,
}

impl InMemoryTaskManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskManager for InMemoryTaskManager {
    async fn get_infos(&self) -> Result<Vec<TaskInfo>> {
        Ok(self.infos.lock().await.clone())
    }

    async fn add_info(&self, info: TaskInfo) -> Result<()> {
        let mut infos = self.infos.lock().await;
        infos.retain(|existing| existing.task_id != info.task_id);
        infos.push(info);
        Ok(())
    }

    async fn remove_info(&self, task_id: &TaskId) -> Result<()> {
        self.infos
            .lock()
            .await
            .retain(|existing| &existing.task_id != task_id);
        Ok(())
    }
}
