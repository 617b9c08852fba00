//! In-memory fakes of the collaborator ports, for tests.
//!
//! Enabled for this crate's own tests and for downstream crates through the
//! `testing` feature.

use crate::events::{JobFailure, Vitals};
use crate::message::{Request, Response};
use crate::ports::{
    CommandOutput, CommandRunner, DispatchFn, FileSystem, JobFailureHandler, JobSpec,
    JobSupervisor, MessageBusHandler, Platform, SpecService,
};
use crate::settings::{DiskSettings, Networks};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

const MAX_SYMLINK_HOPS: usize = 40;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct FakeFsState {
    files: BTreeMap<PathBuf, Vec<u8>>,
    symlinks: BTreeMap<PathBuf, PathBuf>,
    glob_results: HashMap<String, VecDeque<Vec<PathBuf>>>,
    glob_calls: HashMap<String, usize>,
    read_errors: HashMap<PathBuf, String>,
    write_errors: HashMap<PathBuf, String>,
    remove_errors: HashMap<PathBuf, String>,
    writes: Vec<(PathBuf, Vec<u8>)>,
}

/// In-memory filesystem with symlinks and scriptable glob results.
#[derive(Default)]
pub struct FakeFileSystem {
    state: Mutex<FakeFsState>,
}

impl FakeFileSystem {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_file(&self, path: impl AsRef<Path>, contents: impl Into<Vec<u8>>) {
        lock(&self.state)
            .files
            .insert(path.as_ref().to_path_buf(), contents.into());
    }

    /// Create a symlink at `link` pointing at `target`, which may be relative.
    pub fn set_symlink(&self, link: impl AsRef<Path>, target: impl AsRef<Path>) {
        lock(&self.state)
            .symlinks
            .insert(link.as_ref().to_path_buf(), target.as_ref().to_path_buf());
    }

    /// Script successive results for a glob pattern. The last result repeats
    /// once the queue is drained.
    pub fn set_glob_sequence(&self, pattern: &str, results: Vec<Vec<&str>>) {
        let queue = results
            .into_iter()
            .map(|r| r.into_iter().map(PathBuf::from).collect())
            .collect();
        lock(&self.state)
            .glob_results
            .insert(pattern.to_string(), queue);
    }

    pub fn set_glob(&self, pattern: &str, result: Vec<&str>) {
        self.set_glob_sequence(pattern, vec![result]);
    }

    pub fn glob_call_count(&self, pattern: &str) -> usize {
        lock(&self.state)
            .glob_calls
            .get(pattern)
            .copied()
            .unwrap_or(0)
    }

    pub fn fail_read(&self, path: impl AsRef<Path>, message: &str) {
        lock(&self.state)
            .read_errors
            .insert(path.as_ref().to_path_buf(), message.to_string());
    }

    pub fn fail_write(&self, path: impl AsRef<Path>, message: &str) {
        lock(&self.state)
            .write_errors
            .insert(path.as_ref().to_path_buf(), message.to_string());
    }

    pub fn fail_remove(&self, path: impl AsRef<Path>, message: &str) {
        lock(&self.state)
            .remove_errors
            .insert(path.as_ref().to_path_buf(), message.to_string());
    }

    pub fn contents(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        lock(&self.state).files.get(path.as_ref()).cloned()
    }

    pub fn contents_string(&self, path: impl AsRef<Path>) -> Option<String> {
        self.contents(path)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Every write performed, in order.
    pub fn writes(&self) -> Vec<(PathBuf, Vec<u8>)> {
        lock(&self.state).writes.clone()
    }

    fn resolve(state: &FakeFsState, path: &Path) -> Result<PathBuf> {
        let mut pending: VecDeque<PathBuf> = path
            .components()
            .filter(|c| !matches!(c, Component::RootDir | Component::Prefix(_)))
            .map(|c| PathBuf::from(c.as_os_str()))
            .collect();
        let mut resolved = PathBuf::from("/");
        let mut hops = 0;

        while let Some(component) = pending.pop_front() {
            match component.to_str() {
                Some(".") => continue,
                Some("..") => {
                    resolved.pop();
                    continue;
                }
                _ => {}
            }

            let candidate = resolved.join(&component);
            match state.symlinks.get(&candidate) {
                Some(target) => {
                    hops += 1;
                    if hops > MAX_SYMLINK_HOPS {
                        return Err(Error::Other(format!(
                            "Too many levels of symbolic links: {}",
                            path.display()
                        )));
                    }
                    if target.is_absolute() {
                        resolved = PathBuf::from("/");
                    }
                    let target_components: Vec<PathBuf> = target
                        .components()
                        .filter(|c| !matches!(c, Component::RootDir | Component::Prefix(_)))
                        .map(|c| PathBuf::from(c.as_os_str()))
                        .collect();
                    for c in target_components.into_iter().rev() {
                        pending.push_front(c);
                    }
                }
                None => resolved = candidate,
            }
        }

        Ok(resolved)
    }

    fn node_exists(state: &FakeFsState, path: &Path) -> bool {
        state.files.contains_key(path)
            || state.files.keys().any(|k| k.starts_with(path) && k != path)
            || state.symlinks.keys().any(|k| k.starts_with(path) && k != path)
    }
}

#[async_trait]
impl FileSystem for FakeFileSystem {
    async fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        let state = lock(&self.state);
        if let Some(message) = state.read_errors.get(path) {
            return Err(Error::Other(message.clone()));
        }
        let resolved = Self::resolve(&state, path)?;
        state
            .files
            .get(&resolved)
            .cloned()
            .ok_or_else(|| Error::FileNotFound(path.display().to_string()))
    }

    async fn write_file(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let mut state = lock(&self.state);
        if let Some(message) = state.write_errors.get(path) {
            return Err(Error::Other(message.clone()));
        }
        state.writes.push((path.to_path_buf(), contents.to_vec()));
        state.files.insert(path.to_path_buf(), contents.to_vec());
        Ok(())
    }

    async fn remove_file(&self, path: &Path) -> Result<()> {
        let mut state = lock(&self.state);
        if let Some(message) = state.remove_errors.get(path) {
            return Err(Error::Other(message.clone()));
        }
        state.files.remove(path);
        state.symlinks.remove(path);
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let mut state = lock(&self.state);
        let contents = state
            .files
            .remove(from)
            .ok_or_else(|| Error::FileNotFound(from.display().to_string()))?;
        state.files.insert(to.to_path_buf(), contents);
        Ok(())
    }

    async fn exists(&self, path: &Path) -> bool {
        let state = lock(&self.state);
        match Self::resolve(&state, path) {
            Ok(resolved) => Self::node_exists(&state, &resolved),
            Err(_) => false,
        }
    }

    async fn glob(&self, pattern: &str) -> Result<Vec<PathBuf>> {
        let mut state = lock(&self.state);
        *state.glob_calls.entry(pattern.to_string()).or_insert(0) += 1;

        if let Some(queue) = state.glob_results.get_mut(pattern) {
            let result = if queue.len() > 1 {
                queue.pop_front().unwrap_or_default()
            } else {
                queue.front().cloned().unwrap_or_default()
            };
            return Ok(result);
        }

        let compiled = glob::Pattern::new(pattern)
            .map_err(|e| Error::Other(format!("Invalid glob pattern '{}': {}", pattern, e)))?;
        let options = glob::MatchOptions {
            require_literal_separator: true,
            ..glob::MatchOptions::new()
        };
        let mut matches: Vec<PathBuf> = state
            .files
            .keys()
            .chain(state.symlinks.keys())
            .filter(|p| compiled.matches_path_with(p, options))
            .cloned()
            .collect();
        matches.sort();
        matches.dedup();
        Ok(matches)
    }

    async fn canonicalize(&self, path: &Path) -> Result<PathBuf> {
        let state = lock(&self.state);
        let resolved = Self::resolve(&state, path)?;
        if Self::node_exists(&state, &resolved) {
            Ok(resolved)
        } else {
            Err(Error::FileNotFound(path.display().to_string()))
        }
    }
}

/// Records commands and replays scripted results.
#[derive(Default)]
pub struct FakeCommandRunner {
    commands: Mutex<Vec<String>>,
    results: Mutex<HashMap<String, VecDeque<std::result::Result<CommandOutput, String>>>>,
}

impl FakeCommandRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a result for a full command line such as `udevadm settle`.
    pub fn add_result(&self, command_line: &str, result: std::result::Result<CommandOutput, String>) {
        lock(&self.results)
            .entry(command_line.to_string())
            .or_default()
            .push_back(result);
    }

    pub fn add_stdout(&self, command_line: &str, stdout: &str) {
        self.add_result(
            command_line,
            Ok(CommandOutput {
                stdout: stdout.to_string(),
                ..CommandOutput::default()
            }),
        );
    }

    pub fn commands(&self) -> Vec<String> {
        lock(&self.commands).clone()
    }

    pub fn ran(&self, command_line: &str) -> bool {
        lock(&self.commands).iter().any(|c| c == command_line)
    }
}

#[async_trait]
impl CommandRunner for FakeCommandRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let command_line = std::iter::once(program)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        lock(&self.commands).push(command_line.clone());

        let scripted = lock(&self.results)
            .get_mut(&command_line)
            .and_then(|queue| queue.pop_front());

        match scripted {
            Some(Ok(output)) => Ok(output),
            Some(Err(message)) => Err(Error::Command {
                command: command_line,
                message,
            }),
            None => Ok(CommandOutput::default()),
        }
    }
}

/// Platform with recorded side effects.
pub struct FakePlatform {
    pub fs: Arc<FakeFileSystem>,
    pub runner: Arc<FakeCommandRunner>,
    interfaces: Mutex<Vec<String>>,
    interfaces_error: Mutex<Option<String>>,
    networks_setup: Mutex<Vec<Networks>>,
    cdrom: Mutex<HashMap<String, Vec<u8>>>,
    disk_files: Mutex<HashMap<(PathBuf, String), Vec<u8>>>,
    vitals: Mutex<std::result::Result<Vitals, String>>,
}

impl FakePlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fs: FakeFileSystem::new(),
            runner: FakeCommandRunner::new(),
            interfaces: Mutex::new(vec!["eth0".to_string()]),
            interfaces_error: Mutex::new(None),
            networks_setup: Mutex::new(Vec::new()),
            cdrom: Mutex::new(HashMap::new()),
            disk_files: Mutex::new(HashMap::new()),
            vitals: Mutex::new(Ok(Vitals::default())),
        })
    }

    pub fn set_configured_interfaces(&self, interfaces: Vec<&str>) {
        *lock(&self.interfaces) = interfaces.into_iter().map(String::from).collect();
    }

    pub fn fail_interfaces(&self, message: &str) {
        *lock(&self.interfaces_error) = Some(message.to_string());
    }

    pub fn networks_setup(&self) -> Vec<Networks> {
        lock(&self.networks_setup).clone()
    }

    pub fn set_cdrom_file(&self, name: &str, contents: impl Into<Vec<u8>>) {
        lock(&self.cdrom).insert(name.to_string(), contents.into());
    }

    pub fn set_disk_file(&self, disk: &str, name: &str, contents: impl Into<Vec<u8>>) {
        lock(&self.disk_files).insert((PathBuf::from(disk), name.to_string()), contents.into());
    }

    pub fn set_vitals(&self, vitals: std::result::Result<Vitals, String>) {
        *lock(&self.vitals) = vitals;
    }
}

#[async_trait]
impl Platform for FakePlatform {
    fn fs(&self) -> Arc<dyn FileSystem> {
        self.fs.clone()
    }

    fn runner(&self) -> Arc<dyn CommandRunner> {
        self.runner.clone()
    }

    async fn setup_networking(&self, networks: &Networks) -> Result<()> {
        lock(&self.networks_setup).push(networks.clone());
        let mut interfaces = lock(&self.interfaces);
        if interfaces.is_empty() {
            interfaces.push("eth0".to_string());
        }
        Ok(())
    }

    async fn get_configured_network_interfaces(&self) -> Result<Vec<String>> {
        if let Some(message) = lock(&self.interfaces_error).clone() {
            return Err(Error::Platform(message));
        }
        Ok(lock(&self.interfaces).clone())
    }

    async fn get_file_contents_from_cdrom(&self, file_name: &str) -> Result<Vec<u8>> {
        lock(&self.cdrom)
            .get(file_name)
            .cloned()
            .ok_or_else(|| Error::FileNotFound(format!("cdrom:{}", file_name)))
    }

    async fn get_files_contents_from_disk(
        &self,
        disk_path: &Path,
        file_names: &[&str],
    ) -> Result<Vec<Vec<u8>>> {
        let files = lock(&self.disk_files);
        file_names
            .iter()
            .map(|name| {
                files
                    .get(&(disk_path.to_path_buf(), name.to_string()))
                    .cloned()
                    .ok_or_else(|| {
                        Error::FileNotFound(format!("{}:{}", disk_path.display(), name))
                    })
            })
            .collect()
    }

    fn normalize_disk_path(&self, disk: &DiskSettings) -> PathBuf {
        if disk.path.is_empty() {
            PathBuf::from(&disk.volume_id)
        } else {
            PathBuf::from(&disk.path)
        }
    }

    async fn vitals(&self) -> Result<Vitals> {
        lock(&self.vitals).clone().map_err(Error::Platform)
    }
}

/// A message sent through [`FakeMessageBus`].
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub target: String,
    pub topic: String,
    pub message: serde_json::Value,
}

/// Message bus that records outbound messages and lets tests inject requests.
#[derive(Default)]
pub struct FakeMessageBus {
    sent: Mutex<Vec<SentMessage>>,
    send_failures: Mutex<usize>,
    send_attempts: Mutex<usize>,
    dispatch: Mutex<Option<DispatchFn>>,
    run_error: Mutex<Option<String>>,
    registered: Notify,
}

impl FakeMessageBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `count` sends.
    pub fn fail_next_sends(&self, count: usize) {
        *lock(&self.send_failures) = count;
    }

    /// Make `run` return this error right after registering the dispatcher.
    pub fn fail_run(&self, message: &str) {
        *lock(&self.run_error) = Some(message.to_string());
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        lock(&self.sent).clone()
    }

    pub fn send_attempts(&self) -> usize {
        *lock(&self.send_attempts)
    }

    /// Wait until `run` has registered a dispatch function.
    pub async fn wait_for_registration(&self) {
        loop {
            let notified = self.registered.notified();
            if lock(&self.dispatch).is_some() {
                return;
            }
            notified.await;
        }
    }

    /// Deliver a request through the registered dispatch function.
    pub async fn deliver(&self, request: Request) -> Option<Response> {
        let dispatch = lock(&self.dispatch).clone()?;
        Some(dispatch(request).await)
    }
}

#[async_trait]
impl MessageBusHandler for FakeMessageBus {
    async fn run(&self, dispatch: DispatchFn) -> Result<()> {
        *lock(&self.dispatch) = Some(dispatch);
        self.registered.notify_waiters();

        if let Some(message) = lock(&self.run_error).clone() {
            return Err(Error::MessageBus(message));
        }
        std::future::pending::<()>().await;
        Ok(())
    }

    async fn send(&self, target: &str, topic: &str, message: serde_json::Value) -> Result<()> {
        *lock(&self.send_attempts) += 1;
        {
            let mut failures = lock(&self.send_failures);
            if *failures > 0 {
                *failures -= 1;
                return Err(Error::MessageBus("fake-send-error".to_string()));
            }
        }
        lock(&self.sent).push(SentMessage {
            target: target.to_string(),
            topic: topic.to_string(),
            message,
        });
        Ok(())
    }
}

/// Job supervisor with a fixed status that lets tests raise failures.
pub struct FakeJobSupervisor {
    status: Mutex<String>,
    recorded: Mutex<Vec<String>>,
    handler: Mutex<Option<JobFailureHandler>>,
    registered: Notify,
}

impl FakeJobSupervisor {
    pub fn new(status: &str) -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(status.to_string()),
            recorded: Mutex::new(Vec::new()),
            handler: Mutex::new(None),
            registered: Notify::new(),
        })
    }

    pub fn recorded_statuses(&self) -> Vec<String> {
        lock(&self.recorded).clone()
    }

    pub async fn wait_for_monitor(&self) {
        loop {
            let notified = self.registered.notified();
            if lock(&self.handler).is_some() {
                return;
            }
            notified.await;
        }
    }

    /// Report a failure through the registered handler.
    pub async fn raise(&self, failure: JobFailure) -> Result<()> {
        let handler = lock(&self.handler)
            .clone()
            .ok_or_else(|| Error::Internal("No failure handler registered".to_string()))?;
        handler(failure).await
    }
}

#[async_trait]
impl JobSupervisor for FakeJobSupervisor {
    async fn status(&self) -> String {
        lock(&self.status).clone()
    }

    async fn health_recorder(&self, status: &str) {
        lock(&self.recorded).push(status.to_string());
    }

    async fn monitor_job_failures(&self, handler: JobFailureHandler) -> Result<()> {
        *lock(&self.handler) = Some(handler);
        self.registered.notify_waiters();
        std::future::pending::<()>().await;
        Ok(())
    }
}

/// Spec service returning a fixed result.
pub struct FakeSpecService {
    spec: Mutex<std::result::Result<JobSpec, String>>,
}

impl FakeSpecService {
    pub fn new(spec: JobSpec) -> Arc<Self> {
        Arc::new(Self {
            spec: Mutex::new(Ok(spec)),
        })
    }

    pub fn fail(&self, message: &str) {
        *lock(&self.spec) = Err(message.to_string());
    }
}

#[async_trait]
impl SpecService for FakeSpecService {
    async fn get(&self) -> Result<JobSpec> {
        lock(&self.spec).clone().map_err(Error::Other)
    }
}
