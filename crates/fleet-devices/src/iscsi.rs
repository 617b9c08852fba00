use crate::DevicePathResolver;
use crate::error::{ResolveError, Result};
use crate::poll::{PollSettings, poll_until};
use async_trait::async_trait;
use fleet_core::ports::{CommandRunner, FileSystem};
use fleet_core::settings::{DiskSettings, IscsiSettings};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const INITIATOR_NAME_PATH: &str = "/etc/iscsi/initiatorname.iscsi";
const ISCSID_CONF_PATH: &str = "/etc/iscsi/iscsid.conf";
const MAPPER_PATTERN: &str = "/dev/mapper/*";

/// Logs into the disk's iSCSI target and waits for the multipath device to
/// show up under `/dev/mapper`.
pub struct IscsiDevicePathResolver {
    fs: Arc<dyn FileSystem>,
    runner: Arc<dyn CommandRunner>,
    poll: PollSettings,
}

impl IscsiDevicePathResolver {
    pub fn new(fs: Arc<dyn FileSystem>, runner: Arc<dyn CommandRunner>, poll: PollSettings) -> Self {
        Self { fs, runner, poll }
    }

    fn validate(iscsi: &IscsiSettings) -> Result<()> {
        if iscsi.initiator_name.is_empty() {
            return Err(ResolveError::MissingField("iscsi initiator name"));
        }
        if iscsi.username.is_empty() {
            return Err(ResolveError::MissingField("iscsi username"));
        }
        if iscsi.password.is_empty() {
            return Err(ResolveError::MissingField("iscsi password"));
        }
        if iscsi.target.is_empty() {
            return Err(ResolveError::MissingField("iscsi target"));
        }
        Ok(())
    }

    fn iscsid_conf(iscsi: &IscsiSettings) -> String {
        format!(
            "node.startup = automatic\n\
             node.session.auth.authmethod = CHAP\n\
             node.session.auth.username = {username}\n\
             node.session.auth.password = {password}\n\
             discovery.sendtargets.auth.authmethod = CHAP\n\
             discovery.sendtargets.auth.username = {username}\n\
             discovery.sendtargets.auth.password = {password}\n",
            username = iscsi.username,
            password = iscsi.password,
        )
    }

    async fn write_config(&self, path: &str, contents: String) -> Result<()> {
        self.fs
            .write_file(Path::new(path), contents.as_bytes())
            .await
            .map_err(|e| ResolveError::from(e).context(format!("Writing {}", path)))
    }

    async fn connect(&self, iscsi: &IscsiSettings) -> Result<()> {
        self.write_config(
            INITIATOR_NAME_PATH,
            format!("InitiatorName={}\n", iscsi.initiator_name),
        )
        .await?;
        self.write_config(ISCSID_CONF_PATH, Self::iscsid_conf(iscsi)).await?;

        let sessions = self.runner.run("iscsiadm", &["-m", "session"]).await;
        if let Ok(output) = &sessions {
            if output.stdout.contains(&iscsi.target) {
                debug!(target_portal = %iscsi.target, "iSCSI session already established");
                return Ok(());
            }
        }

        self.runner
            .run("iscsiadm", &["-m", "discovery", "-t", "sendtargets", "-p", &iscsi.target])
            .await
            .map_err(|e| ResolveError::from(e).context("Discovering iSCSI targets"))?;
        self.runner
            .run("iscsiadm", &["-m", "node", "-l"])
            .await
            .map_err(|e| ResolveError::from(e).context("Logging into iSCSI targets"))?;

        info!(target_portal = %iscsi.target, "Logged into iSCSI target");
        Ok(())
    }

    /// The one mapper device that is neither a partition nor mounted.
    async fn unused_mapper_devices(&self) -> Result<Option<PathBuf>> {
        let entries = match self.fs.glob(MAPPER_PATTERN).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!(error = %e, "Listing /dev/mapper");
                return Ok(None);
            }
        };

        let mounts = self
            .runner
            .run("mount", &[])
            .await
            .map(|output| output.stdout)
            .map_err(|e| ResolveError::from(e).context("Listing mounts"))?;

        let mut candidates: Vec<PathBuf> = entries
            .into_iter()
            .filter(|entry| {
                let name = entry.file_name().and_then(|n| n.to_str()).unwrap_or_default();
                name != "control" && !name.contains("-part")
            })
            .filter(|entry| !mounts.contains(&entry.display().to_string()))
            .collect();

        match candidates.len() {
            0 => Ok(None),
            1 => Ok(candidates.pop()),
            _ => Err(ResolveError::Ambiguous {
                pattern: MAPPER_PATTERN.to_string(),
                matches: candidates.iter().map(|p| p.display().to_string()).collect(),
            }),
        }
    }
}

#[async_trait]
impl DevicePathResolver for IscsiDevicePathResolver {
    async fn get_real_device_path(&self, disk: &DiskSettings) -> Result<PathBuf> {
        Self::validate(&disk.iscsi)?;
        self.connect(&disk.iscsi).await?;

        poll_until(self.poll, &disk.iscsi.target, || self.unused_mapper_devices()).await
    }
}
