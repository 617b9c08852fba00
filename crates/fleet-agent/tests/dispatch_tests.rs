//! Dispatch and resume behaviour across the dispatcher, task service and
//! task manager.

use async_trait::async_trait;
use fleet_agent::{
    Action, ActionDispatcher, AsyncTaskService, ConcreteActionRunner, DefaultActionFactory,
    FileTaskManager, InMemoryTaskManager, TaskInfo, TaskManager, TaskState,
};
use fleet_core::fakes::{FakeFileSystem, FakeJobSupervisor, FakeSpecService};
use fleet_core::message::{ProtocolVersion, Request, Response};
use fleet_core::ports::JobSpec;
use fleet_core::{Error, FailingIdGenerator, Result, TaskId, UuidGenerator};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Action whose runs block until released.
#[derive(Default)]
struct FakeAction {
    asynchronous: bool,
    persistent: bool,
    fail_with: Option<String>,
    release: Notify,
    runs: AtomicUsize,
    resumes: AtomicUsize,
    cancelled: AtomicBool,
}

impl FakeAction {
    fn sync() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn asynchronous(persistent: bool) -> Arc<Self> {
        Arc::new(Self {
            asynchronous: true,
            persistent,
            ..Self::default()
        })
    }

    fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            fail_with: Some(message.to_string()),
            ..Self::default()
        })
    }
}

#[async_trait]
impl Action for FakeAction {
    fn is_asynchronous(&self, _version: ProtocolVersion) -> bool {
        self.asynchronous
    }

    fn is_persistent(&self) -> bool {
        self.persistent
    }

    fn is_loggable(&self) -> bool {
        true
    }

    async fn run(&self, payload: &[u8], _version: ProtocolVersion) -> Result<Value> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.fail_with {
            return Err(Error::Other(message.clone()));
        }
        if self.asynchronous {
            self.release.notified().await;
        }
        Ok(json!({"ran": String::from_utf8_lossy(payload)}))
    }

    async fn resume(&self, payload: &[u8]) -> Result<Value> {
        self.resumes.fetch_add(1, Ordering::SeqCst);
        self.release.notified().await;
        Ok(json!({"resumed": String::from_utf8_lossy(payload)}))
    }

    fn cancel(&self) -> Result<()> {
        self.cancelled.store(true, Ordering::SeqCst);
        self.release.notify_one();
        Ok(())
    }
}

/// Task manager whose writes always fail.
struct BrokenTaskManager;

#[async_trait]
impl TaskManager for BrokenTaskManager {
    async fn get_infos(&self) -> Result<Vec<TaskInfo>> {
        Err(Error::Persistence("fake-load-error".to_string()))
    }

    async fn add_info(&self, _info: TaskInfo) -> Result<()> {
        Err(Error::Persistence("fake-add-info-error".to_string()))
    }

    async fn remove_info(&self, _task_id: &TaskId) -> Result<()> {
        Ok(())
    }
}

struct Harness {
    factory: Arc<DefaultActionFactory>,
    tasks: AsyncTaskService,
    manager: Arc<dyn TaskManager>,
    dispatcher: ActionDispatcher,
}

impl Harness {
    fn new(manager: Arc<dyn TaskManager>) -> Self {
        Self::with_tasks(manager, AsyncTaskService::new(Arc::new(UuidGenerator)))
    }

    fn with_tasks(manager: Arc<dyn TaskManager>, tasks: AsyncTaskService) -> Self {
        let factory = Arc::new(DefaultActionFactory::new(
            "fake-agent-id",
            tasks.clone(),
            FakeJobSupervisor::new("running"),
            FakeSpecService::new(JobSpec::default()),
        ));
        let dispatcher = ActionDispatcher::new(
            factory.clone(),
            Arc::new(ConcreteActionRunner),
            tasks.clone(),
            manager.clone(),
        );
        Self {
            factory,
            tasks,
            manager,
            dispatcher,
        }
    }

    async fn dispatch(&self, method: &str, payload: &str) -> Response {
        self.dispatcher.dispatch(Request::new(method, payload)).await
    }
}

async fn eventually(check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_for_state(tasks: &AsyncTaskService, id: &TaskId, state: TaskState) {
    eventually(|| tasks.find_task_with_id(id).map(|t| t.state) == Some(state)).await;
}

async fn wait_for_no_infos(manager: &dyn TaskManager) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !manager.get_infos().await.unwrap().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "task records not removed in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn task_id_of(response: &Response) -> TaskId {
    match response {
        Response::Value(value) => TaskId::new(value["agent_task_id"].as_str().unwrap()),
        Response::Exception(message) => panic!("unexpected exception: {}", message),
    }
}

#[tokio::test]
async fn test_unknown_method_is_an_exception() {
    let harness = Harness::new(Arc::new(InMemoryTaskManager::new()));

    let response = harness.dispatch("fake-action", "{}").await;

    assert_eq!(
        String::from_utf8(response.to_json().unwrap()).unwrap(),
        r#"{"exception":{"message":"unknown message fake-action"}}"#
    );
}

#[tokio::test]
async fn test_synchronous_action_returns_value() {
    let harness = Harness::new(Arc::new(InMemoryTaskManager::new()));
    harness.factory.register("fake-action", FakeAction::sync());

    let response = harness.dispatch("fake-action", "fake-payload").await;

    assert_eq!(response, Response::Value(json!({"ran": "fake-payload"})));
}

#[tokio::test]
async fn test_synchronous_failure_names_the_method() {
    let harness = Harness::new(Arc::new(InMemoryTaskManager::new()));
    harness
        .factory
        .register("fake-action", FakeAction::failing("fake-run-error"));

    let response = harness.dispatch("fake-action", "{}").await;

    assert_eq!(
        response,
        Response::exception("Action Failed fake-action: fake-run-error")
    );
}

#[tokio::test]
async fn test_ping_round_trip() {
    let harness = Harness::new(Arc::new(InMemoryTaskManager::new()));
    let response = harness
        .dispatch("ping", r#"{"method":"ping","arguments":[]}"#)
        .await;
    assert_eq!(response, Response::Value(json!("pong")));
}

#[tokio::test]
async fn test_asynchronous_action_reports_running_task() {
    let harness = Harness::new(Arc::new(InMemoryTaskManager::new()));
    let action = FakeAction::asynchronous(false);
    harness.factory.register("fake-action", action.clone());

    let response = harness.dispatch("fake-action", "fake-payload").await;
    let id = task_id_of(&response);

    assert_eq!(
        response,
        Response::Value(json!({"agent_task_id": id.as_str(), "state": "running"}))
    );
    assert!(harness.manager.get_infos().await.unwrap().is_empty());

    action.release.notify_one();
    wait_for_state(&harness.tasks, &id, TaskState::Done).await;
    assert_eq!(
        harness.tasks.find_task_with_id(&id).unwrap().value,
        Some(json!({"ran": "fake-payload"}))
    );
}

#[tokio::test]
async fn test_persistent_task_is_recorded_until_it_finishes() {
    let harness = Harness::new(Arc::new(InMemoryTaskManager::new()));
    let action = FakeAction::asynchronous(true);
    harness.factory.register("fake-action", action.clone());

    let response = harness.dispatch("fake-action", "fake-payload").await;
    let id = task_id_of(&response);

    assert_eq!(
        harness.manager.get_infos().await.unwrap(),
        vec![TaskInfo {
            task_id: id.clone(),
            method: "fake-action".to_string(),
            payload: b"fake-payload".to_vec(),
        }]
    );

    action.release.notify_one();
    wait_for_no_infos(harness.manager.as_ref()).await;
    assert_eq!(
        harness.tasks.find_task_with_id(&id).unwrap().state,
        TaskState::Done
    );
}

#[tokio::test]
async fn test_persistence_failure_starts_nothing() {
    let harness = Harness::new(Arc::new(BrokenTaskManager));
    let action = FakeAction::asynchronous(true);
    harness.factory.register("fake-action", action.clone());

    let response = harness.dispatch("fake-action", "fake-payload").await;

    match response {
        Response::Exception(message) => assert!(message.contains("fake-add-info-error")),
        other => panic!("expected exception, got {:?}", other),
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(action.runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_id_generation_failure_is_an_exception() {
    let tasks = AsyncTaskService::new(Arc::new(FailingIdGenerator("fake-uuid-error".to_string())));
    let harness = Harness::with_tasks(Arc::new(InMemoryTaskManager::new()), tasks);
    harness
        .factory
        .register("fake-action", FakeAction::asynchronous(false));

    let response = harness.dispatch("fake-action", "{}").await;

    match response {
        Response::Exception(message) => assert!(message.contains("fake-uuid-error")),
        other => panic!("expected exception, got {:?}", other),
    }
}

#[tokio::test]
async fn test_cancel_task_reaches_the_action() {
    let harness = Harness::new(Arc::new(InMemoryTaskManager::new()));
    let action = FakeAction::asynchronous(false);
    harness.factory.register("fake-action", action.clone());

    let id = task_id_of(&harness.dispatch("fake-action", "{}").await);
    let payload = json!({"method": "cancel_task", "arguments": [id.as_str()]}).to_string();
    let response = harness.dispatch("cancel_task", &payload).await;

    assert_eq!(response, Response::Value(json!("canceled")));
    assert!(action.cancelled.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_get_task_for_unknown_id() {
    let harness = Harness::new(Arc::new(InMemoryTaskManager::new()));
    let payload = json!({"method": "get_task", "arguments": ["missing-id"]}).to_string();

    let response = harness.dispatch("get_task", &payload).await;

    assert_eq!(
        response,
        Response::exception("Action Failed get_task: Task with id missing-id could not be found")
    );
}

#[tokio::test]
async fn test_resume_restarts_persisted_tasks_under_original_id() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.json");
    let manager = Arc::new(FileTaskManager::new(
        Arc::new(fleet_core::host::HostFileSystem),
        &path,
    ));
    manager
        .add_info(TaskInfo {
            task_id: TaskId::from("persisted-task-id"),
            method: "fake-action".to_string(),
            payload: b"fake-payload".to_vec(),
        })
        .await
        .unwrap();

    let harness = Harness::new(manager.clone());
    let action = FakeAction::asynchronous(true);
    harness.factory.register("fake-action", action.clone());

    harness.dispatcher.resume_previously_dispatched_tasks().await;

    let id = TaskId::from("persisted-task-id");
    eventually(|| action.resumes.load(Ordering::SeqCst) == 1).await;
    assert_eq!(action.runs.load(Ordering::SeqCst), 0);
    assert_eq!(
        harness.tasks.find_task_with_id(&id).unwrap().state,
        TaskState::Running
    );

    action.release.notify_one();
    wait_for_no_infos(manager.as_ref()).await;
    assert_eq!(
        harness.tasks.find_task_with_id(&id).unwrap().value,
        Some(json!({"resumed": "fake-payload"}))
    );
}

#[tokio::test]
async fn test_resuming_twice_keeps_one_live_task() {
    let manager = Arc::new(InMemoryTaskManager::new());
    manager
        .add_info(TaskInfo {
            task_id: TaskId::from("persisted-task-id"),
            method: "fake-action".to_string(),
            payload: b"{}".to_vec(),
        })
        .await
        .unwrap();
    let harness = Harness::new(manager.clone());
    let action = FakeAction::asynchronous(true);
    harness.factory.register("fake-action", action.clone());

    harness.dispatcher.resume_previously_dispatched_tasks().await;
    harness.dispatcher.resume_previously_dispatched_tasks().await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(action.resumes.load(Ordering::SeqCst), 1);
    assert_eq!(manager.get_infos().await.unwrap().len(), 1);

    action.release.notify_one();
    wait_for_no_infos(manager.as_ref()).await;
}

#[tokio::test]
async fn test_resume_drops_unknown_methods_and_continues() {
    let manager = Arc::new(InMemoryTaskManager::new());
    for (id, method) in [("stale-id", "removed-action"), ("live-id", "fake-action")] {
        manager
            .add_info(TaskInfo {
                task_id: TaskId::from(id),
                method: method.to_string(),
                payload: b"{}".to_vec(),
            })
            .await
            .unwrap();
    }
    let harness = Harness::new(manager.clone());
    let action = FakeAction::asynchronous(true);
    harness.factory.register("fake-action", action.clone());

    harness.dispatcher.resume_previously_dispatched_tasks().await;

    let remaining: Vec<TaskId> = manager
        .get_infos()
        .await
        .unwrap()
        .into_iter()
        .map(|info| info.task_id)
        .collect();
    assert_eq!(remaining, vec![TaskId::from("live-id")]);
    assert!(harness.tasks.find_task_with_id(&TaskId::from("stale-id")).is_none());

    action.release.notify_one();
    wait_for_no_infos(manager.as_ref()).await;
}

#[tokio::test]
async fn test_resume_survives_load_failure() {
    let harness = Harness::new(Arc::new(BrokenTaskManager));
    harness.dispatcher.resume_previously_dispatched_tasks().await;
}

#[tokio::test]
async fn test_file_task_manager_with_fake_fs_through_dispatch() {
    let fs = FakeFileSystem::new();
    let manager = Arc::new(FileTaskManager::new(fs.clone(), "/state/tasks.json"));
    let harness = Harness::new(manager);
    let action = FakeAction::asynchronous(true);
    harness.factory.register("fake-action", action.clone());

    harness.dispatch("fake-action", "fake-payload").await;
    assert!(
        fs.contents_string("/state/tasks.json")
            .unwrap()
            .contains(r#""method":"fake-action""#)
    );

    action.release.notify_one();
    eventually(|| fs.contents_string("/state/tasks.json").as_deref() == Some("[]")).await;
}
