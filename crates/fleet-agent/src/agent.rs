//! Main agent run loop.

use crate::dispatcher::ActionDispatcher;
use crate::heartbeat::HeartbeatGenerator;
use fleet_core::events::{HEALTH_MONITOR_TARGET, JobFailure, Topic};
use fleet_core::ports::{JobFailureHandler, JobSupervisor, MessageBusHandler};
use fleet_core::{Error, Result};
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{MissedTickBehavior, interval_at};
use tracing::{debug, error, info};

/// Heartbeat timing and retry budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatSettings {
    pub interval: Duration,
    pub first_attempts: u32,
    pub attempts: u32,
    pub retry_interval: Duration,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            first_attempts: 3,
            attempts: 30,
            retry_interval: Duration::from_secs(1),
        }
    }
}

/// The fleet agent.
pub struct Agent {
    dispatcher: Arc<ActionDispatcher>,
    bus: Arc<dyn MessageBusHandler>,
    supervisor: Arc<dyn JobSupervisor>,
    heartbeats: Arc<HeartbeatGenerator>,
    settings: HeartbeatSettings,
}

impl Agent {
    /// Create a new agent.
    pub fn new(
        dispatcher: Arc<ActionDispatcher>,
        bus: Arc<dyn MessageBusHandler>,
        supervisor: Arc<dyn JobSupervisor>,
        heartbeats: HeartbeatGenerator,
        settings: HeartbeatSettings,
    ) -> Self {
        Self {
            dispatcher,
            bus,
            supervisor,
            heartbeats: Arc::new(heartbeats),
            settings,
        }
    }

    /// Serve requests, send heartbeats and forward job failures until one
    /// of them fails. Returns that first error.
    pub async fn run(&self) -> Result<()> {
        info!("Starting agent");

        let (err_tx, mut err_rx) = mpsc::channel::<Error>(1);
        let mut workers = JoinSet::new();

        let bus = Arc::clone(&self.bus);
        let dispatch = Arc::clone(&self.dispatcher).into_dispatch_fn();
        let tx = err_tx.clone();
        workers.spawn(async move {
            let err = match bus.run(dispatch).await {
                Ok(()) => Error::MessageBus("Message bus handler stopped".to_string()),
                Err(e) => e,
            };
            let _ = tx.send(err).await;
        });

        let heartbeats = Arc::clone(&self.heartbeats);
        let settings = self.settings;
        let tx = err_tx.clone();
        workers.spawn(async move {
            let err = heartbeat_loop(&heartbeats, settings).await;
            let _ = tx.send(err).await;
        });

        let supervisor = Arc::clone(&self.supervisor);
        let handler = alert_handler(Arc::clone(&self.bus));
        let tx = err_tx;
        workers.spawn(async move {
            let err = match supervisor.monitor_job_failures(handler).await {
                Ok(()) => Error::Internal("Job failure monitor stopped".to_string()),
                Err(e) => Error::Internal(format!("Monitoring job failures: {}", e)),
            };
            let _ = tx.send(err).await;
        });

        let err = err_rx
            .recv()
            .await
            .unwrap_or_else(|| Error::Internal("Agent workers exited".to_string()));
        error!(error = %err, "Agent stopping");
        workers.abort_all();
        Err(err)
    }
}

/// Send the first heartbeat right away, then one per interval. Only
/// returns on failure.
async fn heartbeat_loop(heartbeats: &HeartbeatGenerator, settings: HeartbeatSettings) -> Error {
    if let Err(e) = heartbeats
        .send(settings.first_attempts, settings.retry_interval)
        .await
    {
        return e;
    }

    let mut ticker = interval_at(
        tokio::time::Instant::now() + settings.interval,
        settings.interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if let Err(e) = heartbeats
            .send(settings.attempts, settings.retry_interval)
            .await
        {
            return e;
        }
    }
}

fn alert_handler(bus: Arc<dyn MessageBusHandler>) -> JobFailureHandler {
    Arc::new(move |failure: JobFailure| {
        let bus = Arc::clone(&bus);
        async move {
            let Some(alert) = failure.to_alert() else {
                debug!(event = %failure.event, "Ignoring job event");
                return Ok(());
            };
            info!(alert_id = %alert.id, title = %alert.title, "Sending alert");
            let message = serde_json::to_value(&alert)?;
            bus.send(HEALTH_MONITOR_TARGET, Topic::Alert.as_str(), message)
                .await
        }
        .boxed()
    })
}
