//! Host implementations of the filesystem, command runner, and platform ports.

use crate::events::{CpuVitals, DiskVitals, MemoryVitals, Uptime, Vitals};
use crate::ports::{CommandOutput, CommandRunner, FileSystem, Platform};
use crate::settings::{DiskSettings, Network, Networks};
use crate::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use sysinfo::{Disks, System};
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info, warn};

const CDROM_DEVICE: &str = "/dev/sr0";
const CDROM_MOUNT_POINT: &str = "/media/fleet-cdrom";
const DISK_MOUNT_ROOT: &str = "/tmp/fleet-config-disk";

/// Filesystem backed by the real host.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostFileSystem;

#[async_trait]
impl FileSystem for HostFileSystem {
    async fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::FileNotFound(path.display().to_string()),
            _ => Error::Io(e),
        })
    }

    async fn write_file(&self, path: &Path, contents: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, contents).await?;
        Ok(())
    }

    async fn remove_file(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to).await?;
        Ok(())
    }

    async fn exists(&self, path: &Path) -> bool {
        fs::try_exists(path).await.unwrap_or(false)
    }

    async fn glob(&self, pattern: &str) -> Result<Vec<PathBuf>> {
        let paths = glob::glob(pattern)
            .map_err(|e| Error::Other(format!("Invalid glob pattern '{}': {}", pattern, e)))?;
        let mut matches: Vec<PathBuf> = paths.filter_map(|entry| entry.ok()).collect();
        matches.sort();
        Ok(matches)
    }

    async fn canonicalize(&self, path: &Path) -> Result<PathBuf> {
        fs::canonicalize(path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::FileNotFound(path.display().to_string()),
            _ => Error::Io(e),
        })
    }
}

/// Runs programs as child processes of the agent.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostCommandRunner;

#[async_trait]
impl CommandRunner for HostCommandRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let command_line = format!("{} {}", program, args.join(" "));
        debug!(command = %command_line, "Running command");

        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::Command {
                command: command_line.clone(),
                message: e.to_string(),
            })?;

        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        };

        if !output.status.success() {
            return Err(Error::Command {
                command: command_line,
                message: format!("exit code {}: {}", result.exit_code, result.stderr.trim()),
            });
        }

        Ok(result)
    }
}

/// Linux platform operations.
pub struct HostPlatform {
    fs: Arc<dyn FileSystem>,
    runner: Arc<dyn CommandRunner>,
}

impl HostPlatform {
    pub fn new(fs: Arc<dyn FileSystem>, runner: Arc<dyn CommandRunner>) -> Self {
        Self { fs, runner }
    }

    async fn interface_for_mac(&self, mac: &str) -> Result<Option<String>> {
        for address_path in self.fs.glob("/sys/class/net/*/address").await? {
            let address = self.fs.read_file_string(&address_path).await?;
            if address.trim().eq_ignore_ascii_case(mac) {
                let name = address_path
                    .parent()
                    .and_then(|p| p.file_name())
                    .map(|n| n.to_string_lossy().into_owned());
                return Ok(name);
            }
        }
        Ok(None)
    }

    async fn setup_manual_network(&self, name: &str, network: &Network) -> Result<()> {
        let interface = match self.interface_for_mac(&network.mac).await? {
            Some(interface) => interface,
            None => {
                return Err(Error::Platform(format!(
                    "No interface found for network '{}' with mac '{}'",
                    name, network.mac
                )));
            }
        };

        let cidr = format!("{}/{}", network.ip, netmask_to_prefix(&network.netmask)?);
        info!(network = %name, interface = %interface, address = %cidr, "Configuring static network");

        self.runner
            .run("ip", &["addr", "replace", &cidr, "dev", &interface])
            .await?;
        self.runner.run("ip", &["link", "set", &interface, "up"]).await?;

        if network.is_default_for("gateway") && !network.gateway.is_empty() {
            self.runner
                .run("ip", &["route", "replace", "default", "via", &network.gateway])
                .await?;
        }
        Ok(())
    }

    async fn with_mounted<T, F, Fut>(&self, device: &str, mount_point: &str, f: F) -> Result<T>
    where
        F: FnOnce(PathBuf) -> Fut + Send,
        Fut: std::future::Future<Output = Result<T>> + Send,
        T: Send,
    {
        fs::create_dir_all(mount_point).await?;
        self.runner.run("mount", &[device, mount_point]).await?;

        let result = f(PathBuf::from(mount_point)).await;

        if let Err(e) = self.runner.run("umount", &[mount_point]).await {
            warn!(mount_point, error = %e, "Failed to unmount");
        }
        result
    }
}

impl Default for HostPlatform {
    fn default() -> Self {
        Self::new(Arc::new(HostFileSystem), Arc::new(HostCommandRunner))
    }
}

#[async_trait]
impl Platform for HostPlatform {
    fn fs(&self) -> Arc<dyn FileSystem> {
        Arc::clone(&self.fs)
    }

    fn runner(&self) -> Arc<dyn CommandRunner> {
        Arc::clone(&self.runner)
    }

    async fn setup_networking(&self, networks: &Networks) -> Result<()> {
        if networks.is_preconfigured() {
            debug!("Networks are preconfigured, skipping setup");
            return Ok(());
        }

        let mut dhcp_requested = false;
        for (name, network) in networks.iter() {
            if network.preconfigured {
                continue;
            }
            if network.is_dhcp() {
                dhcp_requested = true;
            } else {
                self.setup_manual_network(name, network).await?;
            }
        }

        if dhcp_requested {
            info!("Requesting DHCP lease");
            self.runner.run("dhclient", &["-1"]).await?;
        }
        Ok(())
    }

    async fn get_configured_network_interfaces(&self) -> Result<Vec<String>> {
        let mut interfaces = Vec::new();
        for operstate_path in self.fs.glob("/sys/class/net/*/operstate").await? {
            let Some(name) = operstate_path
                .parent()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned())
            else {
                continue;
            };
            if name == "lo" {
                continue;
            }
            let state = self.fs.read_file_string(&operstate_path).await?;
            if state.trim() == "up" {
                interfaces.push(name);
            }
        }
        Ok(interfaces)
    }

    async fn get_file_contents_from_cdrom(&self, file_name: &str) -> Result<Vec<u8>> {
        self.runner.run("udevadm", &["settle"]).await?;

        let fs = Arc::clone(&self.fs);
        let file_name = file_name.to_string();
        self.with_mounted(CDROM_DEVICE, CDROM_MOUNT_POINT, move |root| async move {
            fs.read_file(&root.join(file_name)).await
        })
        .await
    }

    async fn get_files_contents_from_disk(
        &self,
        disk_path: &Path,
        file_names: &[&str],
    ) -> Result<Vec<Vec<u8>>> {
        let device = disk_path.display().to_string();
        let fs = Arc::clone(&self.fs);
        let file_names: Vec<String> = file_names.iter().map(|f| f.to_string()).collect();

        self.with_mounted(&device, DISK_MOUNT_ROOT, move |root| async move {
            let mut contents = Vec::with_capacity(file_names.len());
            for name in file_names {
                let relative = name.trim_start_matches('/');
                contents.push(fs.read_file(&root.join(relative)).await?);
            }
            Ok(contents)
        })
        .await
    }

    fn normalize_disk_path(&self, disk: &DiskSettings) -> PathBuf {
        if !disk.path.is_empty() {
            PathBuf::from(&disk.path)
        } else {
            PathBuf::from(&disk.volume_id)
        }
    }

    async fn vitals(&self) -> Result<Vitals> {
        tokio::task::spawn_blocking(collect_vitals)
            .await
            .map_err(|e| Error::Internal(format!("Collecting vitals: {}", e)))
    }
}

fn collect_vitals() -> Vitals {
    let mut sys = System::new_all();
    sys.refresh_all();

    let load = System::load_average();
    let percent = |used: u64, total: u64| -> String {
        if total == 0 {
            "0".to_string()
        } else {
            format!("{:.0}", used as f64 / total as f64 * 100.0)
        }
    };

    let mut disk = std::collections::BTreeMap::new();
    for d in Disks::new_with_refreshed_list().list() {
        let key = match d.mount_point().to_str() {
            Some("/") => "system",
            Some("/var/vcap/data") => "ephemeral",
            Some("/var/vcap/store") => "persistent",
            _ => continue,
        };
        let used = d.total_space().saturating_sub(d.available_space());
        disk.insert(
            key.to_string(),
            DiskVitals {
                percent: percent(used, d.total_space()),
                inode_percent: "0".to_string(),
            },
        );
    }

    Vitals {
        cpu: CpuVitals {
            sys: "0.0".to_string(),
            user: format!("{:.1}", sys.global_cpu_usage()),
            wait: "0.0".to_string(),
        },
        disk,
        load: vec![
            format!("{:.2}", load.one),
            format!("{:.2}", load.five),
            format!("{:.2}", load.fifteen),
        ],
        mem: MemoryVitals {
            kb: (sys.used_memory() / 1024).to_string(),
            percent: percent(sys.used_memory(), sys.total_memory()),
        },
        swap: MemoryVitals {
            kb: (sys.used_swap() / 1024).to_string(),
            percent: percent(sys.used_swap(), sys.total_swap()),
        },
        uptime: Uptime {
            secs: System::uptime(),
        },
    }
}

fn netmask_to_prefix(netmask: &str) -> Result<u32> {
    let addr: std::net::Ipv4Addr = netmask
        .parse()
        .map_err(|e| Error::InvalidSettings(format!("Invalid netmask '{}': {}", netmask, e)))?;
    Ok(u32::from(addr).count_ones())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_netmask_to_prefix() {
        assert_eq!(netmask_to_prefix("255.255.255.0").unwrap(), 24);
        assert_eq!(netmask_to_prefix("255.255.0.0").unwrap(), 16);
        assert!(netmask_to_prefix("not-a-mask").is_err());
    }

    #[tokio::test]
    async fn test_host_fs_remove_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let fs = HostFileSystem;
        assert!(fs.remove_file(&dir.path().join("missing")).await.is_ok());
    }

    #[tokio::test]
    async fn test_host_fs_canonicalize_follows_relative_links() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nvme1n1");
        std::fs::write(&target, b"").unwrap();
        let by_id = dir.path().join("by-id");
        std::fs::create_dir(&by_id).unwrap();
        std::os::unix::fs::symlink("../nvme1n1", by_id.join("hop")).unwrap();
        std::os::unix::fs::symlink("hop", by_id.join("link")).unwrap();

        let fs = HostFileSystem;
        let resolved = fs.canonicalize(&by_id.join("link")).await.unwrap();
        assert_eq!(resolved, std::fs::canonicalize(&target).unwrap());
    }

    #[tokio::test]
    async fn test_host_fs_glob_sorted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b"), b"").unwrap();
        std::fs::write(dir.path().join("a"), b"").unwrap();

        let fs = HostFileSystem;
        let pattern = format!("{}/*", dir.path().display());
        let matches = fs.glob(&pattern).await.unwrap();
        assert_eq!(matches, vec![dir.path().join("a"), dir.path().join("b")]);
    }

    #[tokio::test]
    async fn test_host_runner_reports_failure() {
        let runner = HostCommandRunner;
        let err = runner.run("sh", &["-c", "exit 3"]).await.unwrap_err();
        assert!(err.to_string().contains("exit code 3"));

        let ok = runner.run("sh", &["-c", "echo hello"]).await.unwrap();
        assert_eq!(ok.stdout.trim(), "hello");
    }
}
