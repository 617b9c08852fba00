//! Settings sources and their sticky composition.

use crate::error::{Result, SettingsError};
use async_trait::async_trait;
use fleet_core::settings::Settings;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// One channel the infrastructure uses to hand settings to the agent.
#[async_trait]
pub trait SettingsSource: Send + Sync {
    /// Public SSH key to install for `username`. Sources without keys
    /// return an empty string.
    async fn public_ssh_key_for_username(&self, username: &str) -> Result<String>;

    async fn settings(&self) -> Result<Settings>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

/// Tries sources in order. The first source to succeed for a method is
/// remembered and used alone for every later call of that method.
pub struct MultiSettingsSource {
    sources: Vec<Arc<dyn SettingsSource>>,
    settings_source: Mutex<Option<Arc<dyn SettingsSource>>>,
    ssh_key_source: Mutex<Option<Arc<dyn SettingsSource>>>,
}

impl std::fmt::Debug for MultiSettingsSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiSettingsSource")
            .field("sources", &self.sources.iter().map(|s| s.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl MultiSettingsSource {
    pub fn new(sources: Vec<Arc<dyn SettingsSource>>) -> Result<Self> {
        if sources.is_empty() {
            return Err(SettingsError::NoSources);
        }
        Ok(Self {
            sources,
            settings_source: Mutex::new(None),
            ssh_key_source: Mutex::new(None),
        })
    }

    fn sticky(slot: &Mutex<Option<Arc<dyn SettingsSource>>>) -> Option<Arc<dyn SettingsSource>> {
        slot.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn remember(slot: &Mutex<Option<Arc<dyn SettingsSource>>>, source: &Arc<dyn SettingsSource>) {
        *slot.lock().unwrap_or_else(|p| p.into_inner()) = Some(source.clone());
    }
}

#[async_trait]
impl SettingsSource for MultiSettingsSource {
    async fn public_ssh_key_for_username(&self, username: &str) -> Result<String> {
        if let Some(source) = Self::sticky(&self.ssh_key_source) {
            return source.public_ssh_key_for_username(username).await;
        }

        let mut failures = Vec::new();
        for source in &self.sources {
            match source.public_ssh_key_for_username(username).await {
                Ok(key) => {
                    info!(source = source.name(), "Selected SSH key source");
                    Self::remember(&self.ssh_key_source, source);
                    return Ok(key);
                }
                Err(e) => {
                    debug!(source = source.name(), error = %e, "SSH key source failed");
                    failures.push(format!("{}: {}", source.name(), e));
                }
            }
        }
        Err(SettingsError::AllSourcesFailed(failures.join("; ")))
    }

    async fn settings(&self) -> Result<Settings> {
        if let Some(source) = Self::sticky(&self.settings_source) {
            return source.settings().await;
        }

        let mut failures = Vec::new();
        for source in &self.sources {
            match source.settings().await {
                Ok(settings) => {
                    info!(source = source.name(), "Selected settings source");
                    Self::remember(&self.settings_source, source);
                    return Ok(settings);
                }
                Err(e) => {
                    debug!(source = source.name(), error = %e, "Settings source failed");
                    failures.push(format!("{}: {}", source.name(), e));
                }
            }
        }
        Err(SettingsError::AllSourcesFailed(failures.join("; ")))
    }

    fn name(&self) -> &'static str {
        "multi"
    }
}
