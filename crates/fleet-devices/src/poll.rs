//! Deadline-bounded polling shared by the waiting resolvers.

use crate::error::{ResolveError, Result};
use fleet_core::ports::{CommandRunner, FileSystem};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::debug;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_DISK_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to wait for a device and how often to look.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub timeout: Duration,
    pub interval: Duration,
}

impl PollSettings {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self::new(DEFAULT_DISK_WAIT_TIMEOUT)
    }
}

/// Call `attempt` until it yields a value, fails, or the deadline passes.
///
/// The first attempt runs immediately. `Ok(None)` means "not yet".
pub async fn poll_until<T, F, Fut>(settings: PollSettings, subject: &str, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = Instant::now() + settings.timeout;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        if let Some(found) = attempt().await? {
            debug!(subject, attempts, "Device found");
            return Ok(found);
        }
        if Instant::now() >= deadline {
            return Err(ResolveError::TimedOut(subject.to_string()));
        }
        sleep(settings.interval).await;
    }
}

/// Glob once and insist on at most one match.
///
/// Glob failures count as "nothing yet" since sysfs and udev directories
/// can be missing while devices are still being enumerated.
pub(crate) async fn single_match(fs: &dyn FileSystem, pattern: &str) -> Result<Option<PathBuf>> {
    let mut matches = match fs.glob(pattern).await {
        Ok(matches) => matches,
        Err(e) => {
            debug!(pattern, error = %e, "Glob failed, retrying");
            return Ok(None);
        }
    };

    match matches.len() {
        0 => Ok(None),
        1 => Ok(matches.pop()),
        _ => Err(ResolveError::Ambiguous {
            pattern: pattern.to_string(),
            matches: matches.iter().map(|p| p.display().to_string()).collect(),
        }),
    }
}

/// Follow `link` to its final target, returning it only if it exists.
pub(crate) async fn existing_target(fs: &dyn FileSystem, link: &Path) -> Option<PathBuf> {
    let target = match fs.canonicalize(link).await {
        Ok(target) => target,
        Err(e) => {
            debug!(link = %link.display(), error = %e, "Link does not resolve yet");
            return None;
        }
    };
    fs.exists(&target).await.then_some(target)
}

/// Ask udev to replay device events and wait for the queue to drain.
pub(crate) async fn udev_trigger_and_settle(runner: &dyn CommandRunner) -> Result<()> {
    runner
        .run("udevadm", &["trigger"])
        .await
        .map_err(|e| ResolveError::from(e).context("Running udevadm trigger"))?;
    runner
        .run("udevadm", &["settle"])
        .await
        .map_err(|e| ResolveError::from(e).context("Running udevadm settle"))?;
    Ok(())
}

/// Tell every SCSI host to scan all channels, targets and LUNs.
pub(crate) async fn rescan_scsi_hosts(fs: &dyn FileSystem, pattern: &str) -> Result<()> {
    let scan_files = fs
        .glob(pattern)
        .await
        .map_err(|e| ResolveError::from(e).context("Listing SCSI hosts"))?;

    for scan_file in scan_files {
        fs.write_file(&scan_file, b"- - -")
            .await
            .map_err(|e| ResolveError::from(e).context(format!("Rescanning {}", scan_file.display())))?;
    }
    Ok(())
}

/// `/dev/<name>` for a sysfs block entry such as
/// `/sys/bus/scsi/devices/2:0:3:0/block/sdf`.
pub(crate) fn dev_path_for_block_entry(entry: &Path) -> Option<PathBuf> {
    entry
        .file_name()
        .map(|name| Path::new("/dev").join(name))
}
