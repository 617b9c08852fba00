//! Wires the agent's collaborators together and runs it.

use anyhow::Context;
use fleet_agent::{
    ActionDispatcher, Agent, AgentConfig, AsyncTaskService, ConcreteActionRunner,
    DefaultActionFactory, DiskInventory, FileSpecService, FileTaskManager, HeartbeatGenerator,
    UnmonitoredJobSupervisor,
};
use fleet_core::UuidGenerator;
use fleet_core::host::HostPlatform;
use fleet_core::ports::{FileSystem, JobSupervisor, MessageBusHandler, Platform, SpecService};
use fleet_core::settings::Settings;
use fleet_nats::{NatsConfig, NatsHandler};
use fleet_settings::{SettingsSource, SettingsSourceFactory};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

pub async fn run(config_path: &Path) -> anyhow::Result<()> {
    let config = if config_path.exists() {
        AgentConfig::from_file(config_path)
            .with_context(|| format!("Loading config from {}", config_path.display()))?
    } else {
        warn!(path = %config_path.display(), "Config file not found, using defaults");
        AgentConfig::default()
    };

    tokio::fs::create_dir_all(&config.state_dir)
        .await
        .with_context(|| format!("Creating state dir {}", config.state_dir.display()))?;

    let platform: Arc<dyn Platform> = Arc::new(HostPlatform::default());
    let fs = platform.fs();

    let settings = fetch_settings(&config, Arc::clone(&platform)).await?;
    info!(agent_id = %settings.agent_id, "Loaded settings");

    let disks = DiskInventory::for_resolution(
        config.device_path_resolution,
        Arc::clone(&fs),
        platform.runner(),
        config.poll_settings(),
    )
    .discover(&settings)
    .await
    .context("Discovering disks")?;
    info!(
        ephemeral = ?disks.ephemeral,
        persistent = disks.persistent.len(),
        instance_storage = disks.instance_storage.len(),
        "Discovered disks"
    );

    let tasks = match config.max_concurrent_tasks {
        Some(limit) => AsyncTaskService::with_concurrency_limit(Arc::new(UuidGenerator), limit),
        None => AsyncTaskService::default(),
    };
    let supervisor: Arc<dyn JobSupervisor> = Arc::new(UnmonitoredJobSupervisor::new());
    let spec_service: Arc<dyn SpecService> =
        Arc::new(FileSpecService::new(Arc::clone(&fs), config.spec_path()));

    let dispatcher = Arc::new(build_dispatcher(
        &settings,
        &config,
        tasks,
        Arc::clone(&fs),
        Arc::clone(&supervisor),
        Arc::clone(&spec_service),
    ));

    let url = if settings.mbus.is_empty() {
        config.nats_url.clone()
    } else {
        settings.mbus.clone()
    };
    let bus: Arc<dyn MessageBusHandler> = Arc::new(
        NatsHandler::connect(NatsConfig::new(url, settings.agent_id.clone()))
            .await
            .context("Connecting to message bus")?,
    );

    dispatcher.resume_previously_dispatched_tasks().await;

    let heartbeats = HeartbeatGenerator::new(
        Arc::clone(&bus),
        platform,
        Arc::clone(&supervisor),
        spec_service,
    );
    let agent = Agent::new(dispatcher, bus, supervisor, heartbeats, config.heartbeat_settings());

    info!("Starting agent");
    agent.run().await.context("Running agent")?;
    Ok(())
}

async fn fetch_settings(config: &AgentConfig, platform: Arc<dyn Platform>) -> anyhow::Result<Settings> {
    let source = SettingsSourceFactory::new(
        config.settings_sources.clone(),
        platform,
        config.metadata_cache_dir(),
    )
    .new_settings_source()
    .context("Building settings source")?;

    source.settings().await.context("Fetching settings")
}

fn build_dispatcher(
    settings: &Settings,
    config: &AgentConfig,
    tasks: AsyncTaskService,
    fs: Arc<dyn FileSystem>,
    supervisor: Arc<dyn JobSupervisor>,
    spec_service: Arc<dyn SpecService>,
) -> ActionDispatcher {
    let factory = Arc::new(DefaultActionFactory::new(
        settings.agent_id.clone(),
        tasks.clone(),
        supervisor,
        spec_service,
    ));
    let task_manager = Arc::new(FileTaskManager::new(fs, config.tasks_path()));

    ActionDispatcher::new(factory, Arc::new(ConcreteActionRunner), tasks, task_manager)
}
