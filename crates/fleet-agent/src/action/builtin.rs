use super::{Action, string_argument};
use crate::task::{AsyncTaskService, TaskState};
use async_trait::async_trait;
use fleet_core::message::ProtocolVersion;
use fleet_core::ports::{JobSupervisor, SpecService};
use fleet_core::{Error, Result, TaskId};
use serde_json::{Value, json};
use std::sync::Arc;

fn task_not_found(id: &str) -> Error {
    Error::Other(format!("Task with id {} could not be found", id))
}

/// Liveness check.
#[derive(Debug, Default, Clone, Copy)]
pub struct PingAction;

#[async_trait]
impl Action for PingAction {
    fn is_asynchronous(&self, _version: ProtocolVersion) -> bool {
        false
    }

    fn is_persistent(&self) -> bool {
        false
    }

    fn is_loggable(&self) -> bool {
        true
    }

    async fn run(&self, _payload: &[u8], _version: ProtocolVersion) -> Result<Value> {
        Ok(Value::String("pong".to_string()))
    }
}

/// Reports a task's result, or that it is still running.
pub struct GetTaskAction {
    tasks: AsyncTaskService,
}

impl GetTaskAction {
    pub fn new(tasks: AsyncTaskService) -> Self {
        Self { tasks }
    }
}

#[async_trait]
impl Action for GetTaskAction {
    fn is_asynchronous(&self, _version: ProtocolVersion) -> bool {
        false
    }

    fn is_persistent(&self) -> bool {
        false
    }

    fn is_loggable(&self) -> bool {
        true
    }

    async fn run(&self, payload: &[u8], _version: ProtocolVersion) -> Result<Value> {
        let id = string_argument(payload)?;
        let task = self
            .tasks
            .find_task_with_id(&TaskId::new(id.as_str()))
            .ok_or_else(|| task_not_found(&id))?;

        match task.state {
            TaskState::Running => Ok(json!({"agent_task_id": task.id, "state": task.state})),
            TaskState::Done => Ok(task.value.unwrap_or(Value::Null)),
            TaskState::Failed => Err(Error::Other(task.error.unwrap_or_default())),
        }
    }
}

pub struct CancelTaskAction {
    tasks: AsyncTaskService,
}

impl CancelTaskAction {
    pub fn new(tasks: AsyncTaskService) -> Self {
        Self { tasks }
    }
}

#[async_trait]
impl Action for CancelTaskAction {
    fn is_asynchronous(&self, _version: ProtocolVersion) -> bool {
        false
    }

    fn is_persistent(&self) -> bool {
        false
    }

    fn is_loggable(&self) -> bool {
        true
    }

    async fn run(&self, payload: &[u8], _version: ProtocolVersion) -> Result<Value> {
        let id = string_argument(payload)?;
        self.tasks
            .cancel_task(&TaskId::new(id.as_str()))
            .map_err(|e| match e {
                Error::TaskNotFound(_) => task_not_found(&id),
                other => other,
            })?;
        Ok(Value::String("canceled".to_string()))
    }
}

/// Agent identity plus the current job and its health.
pub struct GetStateAction {
    agent_id: String,
    supervisor: Arc<dyn JobSupervisor>,
    spec_service: Arc<dyn SpecService>,
}

impl GetStateAction {
    pub fn new(
        agent_id: impl Into<String>,
        supervisor: Arc<dyn JobSupervisor>,
        spec_service: Arc<dyn SpecService>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            supervisor,
            spec_service,
        }
    }
}

#[async_trait]
impl Action for GetStateAction {
    fn is_asynchronous(&self, _version: ProtocolVersion) -> bool {
        false
    }

    fn is_persistent(&self) -> bool {
        false
    }

    fn is_loggable(&self) -> bool {
        true
    }

    async fn run(&self, _payload: &[u8], _version: ProtocolVersion) -> Result<Value> {
        let spec = self.spec_service.get().await?;
        let job_state = self.supervisor.status().await;

        Ok(json!({
            "agent_id": self.agent_id,
            "job_state": job_state,
            "deployment": spec.deployment,
            "job": spec.job_name,
            "index": spec.index,
            "node_id": spec.node_id,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::fakes::{FakeJobSupervisor, FakeSpecService};
    use fleet_core::ports::JobSpec;
    use futures::FutureExt;
    use std::time::Duration;

    const V0: ProtocolVersion = ProtocolVersion(0);

    fn args(id: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({"method": "get_task", "arguments": [id]})).unwrap()
    }

    #[tokio::test]
    async fn test_ping() {
        assert_eq!(PingAction.run(b"{}", V0).await.unwrap(), json!("pong"));
    }

    #[tokio::test]
    async fn test_get_task_unknown_id() {
        let action = GetTaskAction::new(AsyncTaskService::default());
        let err = action.run(&args("missing-id"), V0).await.unwrap_err();
        assert!(
            err.to_string()
                .contains("Task with id missing-id could not be found")
        );
    }

    #[tokio::test]
    async fn test_get_task_states() {
        let tasks = AsyncTaskService::default();
        let running = tasks.create_task_with_id(
            TaskId::from("running-id"),
            Box::new(|| async { Ok(Value::Null) }.boxed()),
            None,
            None,
        );
        let action = GetTaskAction::new(tasks.clone());

        assert_eq!(
            action.run(&args("running-id"), V0).await.unwrap(),
            json!({"agent_task_id": "running-id", "state": "running"})
        );

        tasks.start_task(&running);
        let failed = tasks.create_task_with_id(
            TaskId::from("failed-id"),
            Box::new(|| async { Err(Error::Other("fake-error".to_string())) }.boxed()),
            None,
            None,
        );
        tasks.start_task(&failed);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(action.run(&args("running-id"), V0).await.unwrap(), Value::Null);
        let err = action.run(&args("failed-id"), V0).await.unwrap_err();
        assert_eq!(err.to_string(), "fake-error");
    }

    #[tokio::test]
    async fn test_cancel_unknown_task() {
        let action = CancelTaskAction::new(AsyncTaskService::default());
        let err = action.run(&args("missing-id"), V0).await.unwrap_err();
        assert!(err.to_string().contains("could not be found"));
    }

    #[tokio::test]
    async fn test_get_state() {
        let spec = JobSpec {
            deployment: "cf".to_string(),
            job_name: Some("router".to_string()),
            index: Some(1),
            node_id: "node-1".to_string(),
        };
        let action = GetStateAction::new(
            "fake-agent-id",
            FakeJobSupervisor::new("failing"),
            FakeSpecService::new(spec),
        );

        let state = action.run(b"{}", V0).await.unwrap();
        assert_eq!(state["agent_id"], "fake-agent-id");
        assert_eq!(state["job_state"], "failing");
        assert_eq!(state["job"], "router");
        assert_eq!(state["index"], 1);
    }
}
