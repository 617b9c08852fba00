//! Job supervisor for hosts without a process monitor.

use async_trait::async_trait;
use fleet_core::Result;
use fleet_core::ports::{JobFailureHandler, JobSupervisor};
use std::sync::Mutex;
use tracing::debug;

/// Reports a fixed job state and never raises failures.
pub struct UnmonitoredJobSupervisor {
    last_recorded: Mutex<Option<String>>,
}

impl UnmonitoredJobSupervisor {
    pub const STATUS: &'static str = "unmonitored";

    pub fn new() -> Self {
        Self {
            last_recorded: Mutex::new(None),
        }
    }

    /// Last status passed to `health_recorder`.
    pub fn last_recorded(&self) -> Option<String> {
        self.last_recorded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Default for UnmonitoredJobSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobSupervisor for UnmonitoredJobSupervisor {
    async fn status(&self) -> String {
        Self::STATUS.to_string()
    }

    async fn health_recorder(&self, status: &str) {
        debug!(status, "Recording job health");
        *self.last_recorded.lock().unwrap_or_else(|e| e.into_inner()) = Some(status.to_string());
    }

    async fn monitor_job_failures(&self, _handler: JobFailureHandler) -> Result<()> {
        futures::future::pending::<()>().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_status_and_health_recording() {
        let supervisor = UnmonitoredJobSupervisor::new();
        assert_eq!(supervisor.status().await, "unmonitored");
        assert_eq!(supervisor.last_recorded(), None);

        supervisor.health_recorder("unmonitored").await;

        assert_eq!(supervisor.last_recorded().as_deref(), Some("unmonitored"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_never_returns() {
        let supervisor = UnmonitoredJobSupervisor::new();
        let handler: JobFailureHandler = Arc::new(|_| async { Ok(()) }.boxed());

        let result = tokio::time::timeout(
            Duration::from_secs(3600),
            supervisor.monitor_job_failures(handler),
        )
        .await;

        assert!(result.is_err());
    }
}
