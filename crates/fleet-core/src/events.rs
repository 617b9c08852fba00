//! Outbound health payloads sent to the monitoring endpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Monitoring target all heartbeats and alerts are addressed to.
pub const HEALTH_MONITOR_TARGET: &str = "hm";

/// Bus topics used for outbound health messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    Heartbeat,
    Alert,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Heartbeat => "heartbeat",
            Topic::Alert => "alert",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Periodic health report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub deployment: String,
    pub job: Option<String>,
    pub index: Option<u32>,
    pub job_state: String,
    pub vitals: Vitals,
    pub node_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Vitals {
    pub cpu: CpuVitals,
    pub disk: BTreeMap<String, DiskVitals>,
    pub load: Vec<String>,
    pub mem: MemoryVitals,
    pub swap: MemoryVitals,
    pub uptime: Uptime,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuVitals {
    pub sys: String,
    pub user: String,
    pub wait: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryVitals {
    pub kb: String,
    pub percent: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskVitals {
    pub percent: String,
    pub inode_percent: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Uptime {
    pub secs: u64,
}

/// Alert severities understood by the health monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Severity {
    Alert = 1,
    Critical = 2,
    Error = 3,
    Warning = 4,
    Ignored = 0,
}

impl From<Severity> for u8 {
    fn from(s: Severity) -> u8 {
        s as u8
    }
}

impl TryFrom<u8> for Severity {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, String> {
        match value {
            0 => Ok(Severity::Ignored),
            1 => Ok(Severity::Alert),
            2 => Ok(Severity::Critical),
            3 => Ok(Severity::Error),
            4 => Ok(Severity::Warning),
            other => Err(format!("Unknown alert severity {}", other)),
        }
    }
}

/// Alert forwarded to the health monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub severity: Severity,
    pub title: String,
    pub summary: String,
    pub created_at: i64,
}

/// A monitored-process failure reported by the job supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub id: String,
    pub service: String,
    pub event: String,
    pub action: String,
    pub date: DateTime<Utc>,
    pub description: String,
}

impl JobFailure {
    /// Convert into an alert. Returns `None` for events that should not
    /// page anyone.
    pub fn to_alert(&self) -> Option<Alert> {
        let severity = self.severity();
        if severity == Severity::Ignored {
            return None;
        }

        Some(Alert {
            id: self.id.clone(),
            severity,
            title: format!("{} - {} - {}", self.service, self.event, self.action),
            summary: self.description.clone(),
            created_at: self.date.timestamp(),
        })
    }

    fn severity(&self) -> Severity {
        match self.event.to_lowercase().as_str() {
            "action done" => Severity::Ignored,
            "pid failed" | "process is not running" | "does not exist" => Severity::Alert,
            "checksum failed" | "connection failed" | "resource limit matched" => {
                Severity::Critical
            }
            "execution failed" | "timeout" => Severity::Error,
            _ => Severity::Warning,
        }
    }
}
