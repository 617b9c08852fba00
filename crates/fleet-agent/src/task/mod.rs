//! In-memory registry of asynchronous, cancelable tasks.

mod manager;

pub use manager::{FileTaskManager, InMemoryTaskManager, TaskInfo, TaskManager};

use fleet_core::{Error, IdGenerator, Result, TaskId, UuidGenerator};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Unit of work executed by a task.
pub type RunFunc = Box<dyn FnOnce() -> BoxFuture<'static, Result<Value>> + Send>;

/// Requests cooperative cancellation of a running task.
pub type CancelFunc = Arc<dyn Fn() -> Result<()> + Send + Sync>;

/// Invoked once with the finished task.
pub type EndFunc = Box<dyn FnOnce(Task) -> BoxFuture<'static, ()> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Running,
    Done,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Running)
    }
}

/// Observable state of a task.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub state: TaskState,
    /// Present once the task is done.
    pub value: Option<Value>,
    /// Present once the task has failed.
    pub error: Option<String>,
}

impl Task {
    fn running(id: TaskId) -> Self {
        Self {
            id,
            state: TaskState::Running,
            value: None,
            error: None,
        }
    }
}

struct TaskEntry {
    task: Task,
    run: Option<RunFunc>,
    cancel: Option<CancelFunc>,
    end: Option<EndFunc>,
}

struct Inner {
    tasks: Mutex<HashMap<TaskId, TaskEntry>>,
    id_generator: Arc<dyn IdGenerator>,
    permits: Option<Arc<Semaphore>>,
}

impl Inner {
    fn tasks(&self) -> MutexGuard<'_, HashMap<TaskId, TaskEntry>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn finish(&self, id: &TaskId, result: Result<Value>) -> Option<(Task, Option<EndFunc>)> {
        let mut tasks = self.tasks();
        let entry = tasks.get_mut(id)?;

        match result {
            Ok(value) => {
                entry.task.state = TaskState::Done;
                entry.task.value = Some(value);
            }
            Err(e) => {
                entry.task.state = TaskState::Failed;
                entry.task.error = Some(e.to_string());
            }
        }
        entry.run = None;
        entry.cancel = None;
        let end = entry.end.take();

        Some((entry.task.clone(), end))
    }
}

/// Runs each started task on its own tokio task.
///
/// Finished tasks stay queryable by id for the life of the service.
#[derive(Clone)]
pub struct AsyncTaskService {
    inner: Arc<Inner>,
}

impl Default for AsyncTaskService {
    fn default() -> Self {
        Self::new(Arc::new(UuidGenerator))
    }
}

impl AsyncTaskService {
    /// Create a task service with unbounded concurrency.
    pub fn new(id_generator: Arc<dyn IdGenerator>) -> Self {
        Self {
            inner: Arc::new(Inner {
                tasks: Mutex::new(HashMap::new()),
                id_generator,
                permits: None,
            }),
        }
    }

    /// Create a task service that runs at most `limit` tasks at a time.
    pub fn with_concurrency_limit(id_generator: Arc<dyn IdGenerator>, limit: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                tasks: Mutex::new(HashMap::new()),
                id_generator,
                permits: Some(Arc::new(Semaphore::new(limit.max(1)))),
            }),
        }
    }

    /// Register a new task under a freshly generated id without starting it.
    pub fn create_task(
        &self,
        run: RunFunc,
        cancel: Option<CancelFunc>,
        end: Option<EndFunc>,
    ) -> Result<Task> {
        let id = self.inner.id_generator.generate().map_err(|e| match e {
            Error::IdGeneration(_) => e,
            other => Error::IdGeneration(other.to_string()),
        })?;
        Ok(self.create_task_with_id(TaskId::new(id), run, cancel, end))
    }

    /// Register a task under a caller-supplied id.
    ///
    /// If a task with this id is still running, the existing task is kept
    /// and the new closures are dropped, so resuming the same id twice never
    /// yields two live executions.
    pub fn create_task_with_id(
        &self,
        id: TaskId,
        run: RunFunc,
        cancel: Option<CancelFunc>,
        end: Option<EndFunc>,
    ) -> Task {
        let mut tasks = self.inner.tasks();

        match tasks.get(&id) {
            Some(existing) if !existing.task.state.is_terminal() => {
                debug!(task_id = %id, "Task already registered, keeping the live one");
                return existing.task.clone();
            }
            _ => {}
        }

        let task = Task::running(id.clone());
        tasks.insert(
            id,
            TaskEntry {
                task: task.clone(),
                run: Some(run),
                cancel,
                end,
            },
        );
        task
    }

    /// Start running a created task. Returns immediately.
    pub fn start_task(&self, task: &Task) {
        let run = match self.inner.tasks().get_mut(&task.id) {
            Some(entry) => entry.run.take(),
            None => None,
        };

        let Some(run) = run else {
            debug!(task_id = %task.id, "Task unknown or already started");
            return;
        };

        let inner = Arc::clone(&self.inner);
        let id = task.id.clone();

        tokio::spawn(async move {
            let _permit = match &inner.permits {
                Some(permits) => Arc::clone(permits).acquire_owned().await.ok(),
                None => None,
            };

            debug!(task_id = %id, "Running task");
            let result = run().await;
            if let Err(e) = &result {
                debug!(task_id = %id, error = %e, "Task failed");
            }

            if let Some((finished, Some(end))) = inner.finish(&id, result) {
                end(finished).await;
            }
        });
    }

    pub fn find_task_with_id(&self, id: &TaskId) -> Option<Task> {
        self.inner.tasks().get(id).map(|entry| entry.task.clone())
    }

    /// Ask a running task to stop. A finished task is left alone.
    pub fn cancel_task(&self, id: &TaskId) -> Result<()> {
        let cancel = {
            let tasks = self.inner.tasks();
            let entry = tasks
                .get(id)
                .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;

            if entry.task.state.is_terminal() {
                return Ok(());
            }
            entry.cancel.clone()
        };

        match cancel {
            Some(cancel) => cancel(),
            None => Err(Error::Other(format!("Task {} cannot be cancelled", id))),
        }
    }

    /// Drop a task that was created but never started.
    pub fn discard_task(&self, id: &TaskId) {
        let mut tasks = self.inner.tasks();
        match tasks.get(id) {
            Some(entry) if entry.run.is_some() => {
                tasks.remove(id);
            }
            Some(_) => warn!(task_id = %id, "Refusing to discard a started task"),
            None => {}
        }
    }
}
