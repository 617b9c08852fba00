//! Heartbeat construction and delivery.

use fleet_core::events::{HEALTH_MONITOR_TARGET, Heartbeat, Topic};
use fleet_core::ports::{JobSupervisor, MessageBusHandler, Platform, SpecService};
use fleet_core::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Builds heartbeats from the current job and host vitals and sends them
/// to the health monitor.
pub struct HeartbeatGenerator {
    bus: Arc<dyn MessageBusHandler>,
    platform: Arc<dyn Platform>,
    supervisor: Arc<dyn JobSupervisor>,
    spec_service: Arc<dyn SpecService>,
}

impl HeartbeatGenerator {
    pub fn new(
        bus: Arc<dyn MessageBusHandler>,
        platform: Arc<dyn Platform>,
        supervisor: Arc<dyn JobSupervisor>,
        spec_service: Arc<dyn SpecService>,
    ) -> Self {
        Self {
            bus,
            platform,
            supervisor,
            spec_service,
        }
    }

    pub async fn heartbeat(&self) -> Result<Heartbeat> {
        let spec = self
            .spec_service
            .get()
            .await
            .map_err(|e| Error::Internal(format!("Getting job spec: {}", e)))?;
        let vitals = self
            .platform
            .vitals()
            .await
            .map_err(|e| Error::Internal(format!("Building vitals: {}", e)))?;
        let job_state = self.supervisor.status().await;

        Ok(Heartbeat {
            deployment: spec.deployment,
            job: spec.job_name,
            index: spec.index,
            job_state,
            vitals,
            node_id: spec.node_id,
        })
    }

    /// Send one heartbeat, trying up to `attempts` times.
    ///
    /// Failing to build the heartbeat is not retried.
    pub async fn send(&self, attempts: u32, retry_interval: Duration) -> Result<()> {
        let heartbeat = self.heartbeat().await?;
        self.supervisor.health_recorder(&heartbeat.job_state).await;
        let message = serde_json::to_value(&heartbeat)?;

        let attempts = attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .bus
                .send(HEALTH_MONITOR_TARGET, Topic::Heartbeat.as_str(), message.clone())
                .await
            {
                Ok(()) => {
                    debug!(job_state = %heartbeat.job_state, attempt, "Heartbeat sent");
                    return Ok(());
                }
                Err(e) if attempt < attempts => {
                    warn!(attempt, attempts, error = %e, "Sending heartbeat failed, retrying");
                    tokio::time::sleep(retry_interval).await;
                }
                Err(e) => {
                    return Err(Error::MessageBus(format!(
                        "Sending heartbeat after {} attempts: {}",
                        attempts, e
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::fakes::{FakeJobSupervisor, FakeMessageBus, FakePlatform, FakeSpecService};
    use fleet_core::ports::JobSpec;
    use pretty_assertions::assert_eq;
    use serde_json::json;

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

        fn generator(&self) -> HeartbeatGenerator {
            HeartbeatGenerator::new(
                self.bus.clone(),
                self.platform.clone(),
                self.supervisor.clone(),
                self.spec.clone(),
            )
        }
    }

    #[tokio::test]
    async fn test_sends_heartbeat_to_health_monitor() {
        let fixture = Fixture::new();
        fixture
            .generator()
            .send(3, Duration::from_millis(1))
            .await
            .unwrap();

        let sent = fixture.bus.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].target, "hm");
        assert_eq!(sent[0].topic, "heartbeat");
        assert_eq!(sent[0].message["deployment"], json!("fake-deployment"));
        assert_eq!(sent[0].message["job"], json!("fake-job"));
        assert_eq!(sent[0].message["index"], json!(0));
        assert_eq!(sent[0].message["job_state"], json!("running"));
        assert_eq!(sent[0].message["node_id"], json!("fake-node-id"));
        assert_eq!(fixture.supervisor.recorded_statuses(), vec!["running"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_sent() {
        let fixture = Fixture::new();
        fixture.bus.fail_next_sends(2);

        fixture
            .generator()
            .send(3, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(fixture.bus.send_attempts(), 3);
        assert_eq!(fixture.bus.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_attempts() {
        let fixture = Fixture::new();
        fixture.bus.fail_next_sends(10);

        let err = fixture
            .generator()
            .send(3, Duration::from_secs(1))
            .await
            .unwrap_err();

        assert_eq!(fixture.bus.send_attempts(), 3);
        assert!(err.to_string().contains("fake-send-error"));
    }

    #[tokio::test]
    async fn test_spec_failure_is_not_retried() {
        let fixture = Fixture::new();
        fixture.spec.fail("fake-spec-error");

        let err = fixture
            .generator()
            .send(3, Duration::from_millis(1))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("fake-spec-error"));
        assert_eq!(fixture.bus.send_attempts(), 0);
    }

    #[tokio::test]
    async fn test_vitals_failure_is_fatal() {
        let fixture = Fixture::new();
        fixture.platform.set_vitals(Err("fake-vitals-error".to_string()));

        let err = fixture.generator().heartbeat().await.unwrap_err();
        assert!(err.to_string().contains("fake-vitals-error"));
    }
}
