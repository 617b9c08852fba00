use crate::contents::parse_settings;
use crate::error::{Result, SettingsError};
use crate::source::SettingsSource;
use async_trait::async_trait;
use fleet_core::ports::FileSystem;
use fleet_core::settings::Settings;
use std::path::PathBuf;
use std::sync::Arc;

/// Settings from a JSON file on the local filesystem.
pub struct FileSettingsSource {
    fs: Arc<dyn FileSystem>,
    settings_path: PathBuf,
}

impl FileSettingsSource {
    pub fn new(fs: Arc<dyn FileSystem>, settings_path: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            settings_path: settings_path.into(),
        }
    }
}

#[async_trait]
impl SettingsSource for FileSettingsSource {
    async fn public_ssh_key_for_username(&self, _username: &str) -> Result<String> {
        Ok(String::new())
    }

    async fn settings(&self) -> Result<Settings> {
        let raw = self.fs.read_file(&self.settings_path).await.map_err(|e| {
            SettingsError::from(e).context(format!(
                "Reading settings file {}",
                self.settings_path.display()
            ))
        })?;
        parse_settings(&raw, "settings file")
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_reads_settings_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"agent_id":"agent-1","mbus":"nats://10.0.0.2:4222"}}"#).unwrap();
        let source = FileSettingsSource::new(
            Arc::new(fleet_core::host::HostFileSystem),
            file.path(),
        );

        let settings = source.settings().await.unwrap();
        assert_eq!(settings.agent_id, "agent-1");
        assert_eq!(settings.mbus, "nats://10.0.0.2:4222");
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let source = FileSettingsSource::new(
            fleet_core::fakes::FakeFileSystem::new(),
            "/var/vcap/bosh/settings.json",
        );
        let err = source.settings().await.unwrap_err();
        assert!(err.to_string().starts_with("Reading settings file"));
    }
}
