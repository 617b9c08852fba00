//! Agent configuration.

use crate::agent::HeartbeatSettings;
use fleet_core::{Error, Result};
use fleet_devices::{DeviceResolution, PollSettings};
use fleet_settings::SourceOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Directory holding persisted tasks and metadata caches.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// NATS server URL, used when the settings carry no mbus URL.
    #[serde(default = "default_nats_url")]
    pub nats_url: String,
    /// Seconds between periodic heartbeats.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Send attempts for the first heartbeat after boot.
    #[serde(default = "default_first_heartbeat_retries")]
    pub first_heartbeat_retries: u32,
    /// Send attempts for each periodic heartbeat.
    #[serde(default = "default_heartbeat_retries")]
    pub heartbeat_retries: u32,
    /// Delay between heartbeat send attempts, in milliseconds.
    #[serde(default = "default_heartbeat_retry_interval")]
    pub heartbeat_retry_interval_ms: u64,
    /// How long to wait for a disk to show up, in seconds.
    #[serde(default = "default_disk_wait_timeout")]
    pub disk_wait_timeout_secs: u64,
    /// Delay between device lookups, in milliseconds.
    #[serde(default = "default_device_poll_interval")]
    pub device_poll_interval_ms: u64,
    /// How disks are addressed on this infrastructure.
    #[serde(default)]
    pub device_path_resolution: DeviceResolution,
    /// Ordered settings sources.
    #[serde(default)]
    pub settings_sources: Vec<SourceOptions>,
    /// Upper bound on concurrently running tasks. Unbounded when unset.
    #[serde(default)]
    pub max_concurrent_tasks: Option<usize>,
    /// Job spec file. Defaults to `spec.json` in the state directory.
    #[serde(default)]
    pub spec_path: Option<PathBuf>,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/fleet-agent")
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_heartbeat_interval() -> u64 {
    60
}

fn default_first_heartbeat_retries() -> u32 {
    3
}

fn default_heartbeat_retries() -> u32 {
    30
}

fn default_heartbeat_retry_interval() -> u64 {
    1000
}

fn default_disk_wait_timeout() -> u64 {
    30
}

fn default_device_poll_interval() -> u64 {
    500
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            nats_url: default_nats_url(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            first_heartbeat_retries: default_first_heartbeat_retries(),
            heartbeat_retries: default_heartbeat_retries(),
            heartbeat_retry_interval_ms: default_heartbeat_retry_interval(),
            disk_wait_timeout_secs: default_disk_wait_timeout(),
            device_poll_interval_ms: default_device_poll_interval(),
            device_path_resolution: DeviceResolution::default(),
            settings_sources: vec![],
            max_concurrent_tasks: None,
            spec_path: None,
        }
    }
}

impl AgentConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from YAML (or JSON) text.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents).map_err(|e| Error::InvalidSettings(format!("Parsing agent config: {}", e)))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_retry_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_retry_interval_ms)
    }

    pub fn heartbeat_settings(&self) -> HeartbeatSettings {
        HeartbeatSettings {
            interval: self.heartbeat_interval(),
            first_attempts: self.first_heartbeat_retries,
            attempts: self.heartbeat_retries,
            retry_interval: self.heartbeat_retry_interval(),
        }
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings::new(Duration::from_secs(self.disk_wait_timeout_secs))
            .with_interval(Duration::from_millis(self.device_poll_interval_ms))
    }

    pub fn tasks_path(&self) -> PathBuf {
        self.state_dir.join("tasks.json")
    }

    pub fn spec_path(&self) -> PathBuf {
        self.spec_path
            .clone()
            .unwrap_or_else(|| self.state_dir.join("spec.json"))
    }

    pub fn metadata_cache_dir(&self) -> PathBuf {
        self.state_dir.join("metadata")
    }
}
