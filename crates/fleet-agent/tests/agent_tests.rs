//! Agent run loop against fake collaborators.

use chrono::DateTime;
use fleet_agent::{
    ActionDispatcher, Agent, AsyncTaskService, ConcreteActionRunner, DefaultActionFactory,
    HeartbeatGenerator, HeartbeatSettings, InMemoryTaskManager,
};
use fleet_core::events::JobFailure;
use fleet_core::fakes::{FakeJobSupervisor, FakeMessageBus, FakePlatform, FakeSpecService};
use fleet_core::message::{Request, Response};
use fleet_core::ports::JobSpec;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    bus: Arc<FakeMessageBus>,
    platform: Arc<FakePlatform>,
    supervisor: Arc<FakeJobSupervisor>,
    spec: Arc<FakeSpecService>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            bus: FakeMessageBus::new(),
            platform: FakePlatform::new(),
            supervisor: FakeJobSupervisor::new("running"),
            spec: FakeSpecService::new(JobSpec {
                deployment: "fake-deployment".to_string(),
                job_name: Some("fake-job".to_string()),
                index: Some(0),
                node_id: "fake-node-id".to_string(),
            }),
        }
    }

    fn agent(&self, settings: HeartbeatSettings) -> Arc<Agent> {
        let tasks = AsyncTaskService::default();
        let factory = Arc::new(DefaultActionFactory::new(
            "fake-agent-id",
            tasks.clone(),
            self.supervisor.clone(),
            self.spec.clone(),
        ));
        let dispatcher = Arc::new(ActionDispatcher::new(
            factory,
            Arc::new(ConcreteActionRunner),
            tasks,
            Arc::new(InMemoryTaskManager::new()),
        ));
        let heartbeats = HeartbeatGenerator::new(
            self.bus.clone(),
            self.platform.clone(),
            self.supervisor.clone(),
            self.spec.clone(),
        );

        Arc::new(Agent::new(
            dispatcher,
            self.bus.clone(),
            self.supervisor.clone(),
            heartbeats,
            settings,
        ))
    }
}

fn fast_heartbeats() -> HeartbeatSettings {
    HeartbeatSettings {
        interval: Duration::from_secs(60),
        first_attempts: 3,
        attempts: 30,
        retry_interval: Duration::from_millis(1),
    }
}

fn spawn_agent(agent: Arc<Agent>) -> tokio::task::JoinHandle<fleet_core::Result<()>> {
    tokio::spawn(async move { agent.run().await })
}

#[tokio::test]
async fn test_sends_first_heartbeat_and_serves_requests() {
    let fixture = Fixture::new();
    let handle = spawn_agent(fixture.agent(fast_heartbeats()));

    fixture.bus.wait_for_registration().await;
    let response = fixture
        .bus
        .deliver(Request::new("ping", r#"{"method":"ping","arguments":[]}"#))
        .await;
    assert_eq!(response, Some(Response::Value(json!("pong"))));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while fixture.bus.sent().is_empty() {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let sent = fixture.bus.sent();
    assert_eq!(sent[0].target, "hm");
    assert_eq!(sent[0].topic, "heartbeat");
    assert_eq!(sent[0].message["job_state"], json!("running"));

    handle.abort();
}

#[tokio::test(start_paused = true)]
async fn test_periodic_heartbeats_follow_interval() {
    let fixture = Fixture::new();
    let handle = spawn_agent(fixture.agent(fast_heartbeats()));

    fixture.bus.wait_for_registration().await;
    tokio::time::sleep(Duration::from_secs(125)).await;

    let heartbeats = fixture
        .bus
        .sent()
        .into_iter()
        .filter(|m| m.topic == "heartbeat")
        .count();
    assert_eq!(heartbeats, 3);

    handle.abort();
}

#[tokio::test(start_paused = true)]
async fn test_first_heartbeat_failure_stops_agent() {
    let fixture = Fixture::new();
    fixture.bus.fail_next_sends(3);

    let err = fixture.agent(fast_heartbeats()).run().await.unwrap_err();

    assert!(err.to_string().contains("fake-send-error"));
    assert_eq!(fixture.bus.send_attempts(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_first_heartbeat_recovers_within_budget() {
    let fixture = Fixture::new();
    fixture.bus.fail_next_sends(2);
    let handle = spawn_agent(fixture.agent(fast_heartbeats()));

    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(fixture.bus.sent().len(), 1);
    assert!(!handle.is_finished());
    handle.abort();
}

#[tokio::test]
async fn test_spec_failure_stops_agent() {
    let fixture = Fixture::new();
    fixture.spec.fail("fake-spec-error");

    let err = fixture.agent(fast_heartbeats()).run().await.unwrap_err();

    assert!(err.to_string().contains("fake-spec-error"));
}

#[tokio::test]
async fn test_bus_failure_stops_agent() {
    let fixture = Fixture::new();
    fixture.bus.fail_run("fake-bus-error");

    let err = fixture.agent(fast_heartbeats()).run().await.unwrap_err();

    assert!(err.to_string().contains("fake-bus-error"));
}

#[tokio::test]
async fn test_job_failures_become_alerts() {
    let fixture = Fixture::new();
    let handle = spawn_agent(fixture.agent(fast_heartbeats()));
    fixture.supervisor.wait_for_monitor().await;

    fixture
        .supervisor
        .raise(JobFailure {
            id: "fake-failure-id".to_string(),
            service: "nginx".to_string(),
            event: "pid failed".to_string(),
            action: "restart".to_string(),
            date: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            description: "process exited".to_string(),
        })
        .await
        .unwrap();

    let alerts: Vec<_> = fixture
        .bus
        .sent()
        .into_iter()
        .filter(|m| m.topic == "alert")
        .collect();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].target, "hm");
    assert_eq!(alerts[0].message["id"], json!("fake-failure-id"));
    assert_eq!(alerts[0].message["severity"], json!(1));
    assert_eq!(alerts[0].message["title"], json!("nginx - pid failed - restart"));
    assert_eq!(alerts[0].message["created_at"], json!(1_700_000_000));

    handle.abort();
}

#[tokio::test]
async fn test_ignored_job_events_send_nothing() {
    let fixture = Fixture::new();
    let handle = spawn_agent(fixture.agent(fast_heartbeats()));
    fixture.supervisor.wait_for_monitor().await;

    fixture
        .supervisor
        .raise(JobFailure {
            id: "fake-failure-id".to_string(),
            service: "nginx".to_string(),
            event: "action done".to_string(),
            action: "start".to_string(),
            date: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            description: String::new(),
        })
        .await
        .unwrap();

    assert!(fixture.bus.sent().iter().all(|m| m.topic != "alert"));
    handle.abort();
}
