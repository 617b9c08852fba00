use crate::contents::{MetadataContents, parse_settings};
use crate::error::{Result, SettingsError};
use crate::source::SettingsSource;
use async_trait::async_trait;
use fleet_core::ports::Platform;
use fleet_core::settings::Settings;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct Loaded {
    metadata: MetadataContents,
    settings: Settings,
}

/// Settings from an OpenStack-style config drive.
///
/// Each candidate disk is mounted in turn until one yields both the
/// metadata and the settings file. The contents are read once.
pub struct ConfigDriveSettingsSource {
    platform: Arc<dyn Platform>,
    disk_paths: Vec<PathBuf>,
    meta_data_path: String,
    settings_path: String,
    loaded: OnceCell<Loaded>,
}

impl ConfigDriveSettingsSource {
    pub fn new(
        platform: Arc<dyn Platform>,
        disk_paths: Vec<PathBuf>,
        meta_data_path: impl Into<String>,
        settings_path: impl Into<String>,
    ) -> Self {
        Self {
            platform,
            disk_paths,
            meta_data_path: meta_data_path.into(),
            settings_path: settings_path.into(),
            loaded: OnceCell::new(),
        }
    }

    async fn load_from(&self, disk_path: &Path) -> Result<Loaded> {
        let contents = self
            .platform
            .get_files_contents_from_disk(disk_path, &[self.meta_data_path.as_str(), self.settings_path.as_str()])
            .await?;
        let [metadata, settings] = contents.as_slice() else {
            return Err(SettingsError::Missing(format!(
                "Expected 2 files from {} but read {}",
                disk_path.display(),
                contents.len()
            )));
        };

        Ok(Loaded {
            metadata: MetadataContents::from_slice(metadata)?,
            settings: parse_settings(settings, "config drive settings")?,
        })
    }

    async fn load(&self) -> Result<&Loaded> {
        self.loaded
            .get_or_try_init(|| async {
                let mut failures = Vec::new();
                for disk_path in &self.disk_paths {
                    match self.load_from(disk_path).await {
                        Ok(loaded) => {
                            info!(disk = %disk_path.display(), "Loaded config drive");
                            return Ok(loaded);
                        }
                        Err(e) => {
                            debug!(disk = %disk_path.display(), error = %e, "Config drive candidate failed");
                            failures.push(format!("{}: {}", disk_path.display(), e));
                        }
                    }
                }
                Err(SettingsError::Missing(format!(
                    "Loading config drive: {}",
                    failures.join("; ")
                )))
            })
            .await
    }
}

#[async_trait]
impl SettingsSource for ConfigDriveSettingsSource {
    async fn public_ssh_key_for_username(&self, _username: &str) -> Result<String> {
        Ok(self.load().await?.metadata.public_key())
    }

    async fn settings(&self) -> Result<Settings> {
        Ok(self.load().await?.settings.clone())
    }

    fn name(&self) -> &'static str {
        "config-drive"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::fakes::FakePlatform;

    const META_DATA: &str = "ec2/latest/meta-data.json";
    const SETTINGS: &str = "openstack/latest/settings.json";

    fn source(platform: Arc<FakePlatform>) -> ConfigDriveSettingsSource {
        ConfigDriveSettingsSource::new(
            platform,
            vec![
                PathBuf::from("/dev/disk/by-label/CONFIG-2"),
                PathBuf::from("/dev/disk/by-label/config-2"),
            ],
            META_DATA,
            SETTINGS,
        )
    }

    #[tokio::test]
    async fn test_falls_through_to_second_disk() {
        let platform = FakePlatform::new();
        platform.set_disk_file(
            "/dev/disk/by-label/config-2",
            META_DATA,
            r#"{"public-keys":{"0":{"openssh-key":"ssh-rsa key"}}}"#,
        );
        platform.set_disk_file("/dev/disk/by-label/config-2", SETTINGS, r#"{"agent_id":"agent-1"}"#);
        let source = source(platform);

        assert_eq!(source.settings().await.unwrap().agent_id, "agent-1");
        assert_eq!(source.public_ssh_key_for_username("vcap").await.unwrap(), "ssh-rsa key");
    }

    #[tokio::test]
    async fn test_no_disk_has_the_files() {
        let err = source(FakePlatform::new()).settings().await.unwrap_err();
        assert!(err.to_string().contains("CONFIG-2"));
    }
}
