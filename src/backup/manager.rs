use super::marshal::EventMarshaler;
use super::scheduler::{BackupScheduler, SchedulerConfig, StartOutcome};
use super::{
    ArchiveSummary, BackupEvent, BackupState, FastZip, JobEvent, JobId, SevenZip, ToolCapability, ToolRegistry,
};
use crate::error::{Result, ZipBackupError};
use crate::preferences::{PreferenceStore, Settings, SettingsPatch, SettingsSnapshot};
use crate::storage::{HistoryEntry, Storage};
use crate::utils::config::Config;
use crate::utils::log_buffer::{LogBuffer, LogEntry};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Handle to the control loop. Cheap to clone; every clone talks to the same loop.
#[derive(Clone)]
pub struct BackupManager {
    command_tx: mpsc::Sender<Command>,
    event_tx: broadcast::Sender<BackupEvent>,
    status: Arc<RwLock<BackupStatus>>,
    storage: Option<Storage>,
    log_buffer: LogBuffer,
}

#[derive(Debug)]
pub enum Command {
    BackupNow { reply: oneshot::Sender<Result<StartOutcome>> },
    Preferences { reply: oneshot::Sender<SettingsSnapshot> },
    UpdatePreferences { patch: SettingsPatch, reply: oneshot::Sender<SettingsSnapshot> },
    ResetPreferences { reply: oneshot::Sender<SettingsSnapshot> },
    Shutdown,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupStatus {
    pub state: BackupState,
    pub active_job: Option<JobId>,
    pub active_output: Option<PathBuf>,
    pub auto_backup: bool,
    pub auto_suspended: bool,
    pub last_backup: Option<DateTime<Utc>>,
    pub next_backup: Option<DateTime<Utc>>,
    pub tools: Vec<ToolCapability>,
    pub warnings: Vec<String>,
    pub last_archive: Option<ArchiveSummary>,
}

impl BackupStatus {
    async fn capture(scheduler: &BackupScheduler) -> Self {
        let settings = scheduler.settings();
        let running = scheduler.state() == BackupState::Running;
        let last_backup = settings.last_backup().await;
        let next_backup = if running {
            None
        } else {
            scheduler.next_backup_after(last_backup).await
        };
        Self {
            state: scheduler.state(),
            active_job: scheduler.active_job(),
            active_output: scheduler.active_output().map(|p| p.to_path_buf()),
            auto_backup: settings.auto_backup.get().await,
            auto_suspended: scheduler.auto_suspended(),
            last_backup,
            next_backup,
            tools: scheduler.tools().to_vec(),
            warnings: scheduler.tool_warnings().to_vec(),
            last_archive: scheduler.last_summary().cloned(),
        }
    }
}

impl BackupManager {
    /// Wires the real tools and the sqlite-backed preferences, then starts the loop.
    pub async fn new(config: &Config, storage: Storage) -> Self {
        let (scheduler, marshaler) = Self::build_scheduler(config, &storage).await;
        Self::spawn(scheduler, marshaler, Some(storage), config.tick).await
    }

    pub async fn build_scheduler(config: &Config, storage: &Storage) -> (BackupScheduler, EventMarshaler<JobEvent>) {
        let registry = ToolRegistry::new()
            .with_tool(Arc::new(FastZip::new(&config.asset_root)))
            .with_tool(Arc::new(SevenZip::new(&config.tools_dir)));
        registry.refresh().await;

        for capability in registry.capabilities() {
            match &capability.executable {
                Some(path) => info!("{} found at {} (supported: {})", capability.tool, path.display(), capability.supported),
                None => debug!("{} executable not found", capability.tool),
            }
        }
        for warning in registry.availability_warnings() {
            if registry.any_supported() {
                warn!("{}", warning);
            } else {
                error!("{}", warning);
            }
        }

        let store = PreferenceStore::new(Arc::new(storage.clone()));
        let settings = Settings::initialize(&store, registry.default_mode());
        let marshaler = EventMarshaler::new();
        let scheduler = BackupScheduler::new(
            settings,
            Arc::new(registry),
            marshaler.handle(),
            SchedulerConfig::from(config),
        )
        .with_logs(LogBuffer::new(1000));

        (scheduler, marshaler)
    }

    /// Starts the control loop around an already assembled scheduler.
    pub async fn spawn(
        scheduler: BackupScheduler,
        marshaler: EventMarshaler<JobEvent>,
        storage: Option<Storage>,
        tick: Duration,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(32);
        let (event_tx, _) = broadcast::channel(256);
        let status = Arc::new(RwLock::new(BackupStatus::capture(&scheduler).await));
        let log_buffer = scheduler.logs().clone();

        tokio::spawn(Self::control_loop(
            scheduler,
            marshaler,
            command_rx,
            event_tx.clone(),
            status.clone(),
            storage.clone(),
            tick,
        ));

        Self {
            command_tx,
            event_tx,
            status,
            storage,
            log_buffer,
        }
    }

    async fn control_loop(
        mut scheduler: BackupScheduler,
        marshaler: EventMarshaler<JobEvent>,
        mut rx: mpsc::Receiver<Command>,
        event_tx: broadcast::Sender<BackupEvent>,
        status: Arc<RwLock<BackupStatus>>,
        storage: Option<Storage>,
        tick: Duration,
    ) {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Backup control loop started (tick: {})", humantime::format_duration(tick));

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => Self::handle_command(&mut scheduler, cmd).await,
                },
                _ = interval.tick() => scheduler.poll().await,
                _ = marshaler.notified() => {}
            }

            for event in marshaler.drain() {
                if let Some(summary) = scheduler.handle_event(event).await {
                    if let Some(storage) = &storage {
                        if let Err(e) = storage.record_backup(&summary).await {
                            error!("Failed to record backup history: {}", e);
                        }
                    }
                }
            }

            // status first, so observers of an event read a status that includes it
            let snapshot = BackupStatus::capture(&scheduler).await;
            *status.write() = snapshot;
            for event in scheduler.take_events() {
                let _ = event_tx.send(event);
            }
        }

        if let Some(job) = scheduler.active_job() {
            warn!("Shutting down while job {} is still running", job);
        }
        scheduler.settings().store().teardown();
        info!("Backup control loop stopped");
    }

    async fn handle_command(scheduler: &mut BackupScheduler, cmd: Command) {
        match cmd {
            Command::BackupNow { reply } => {
                info!("Manual backup requested");
                scheduler.refresh_tools().await;
                let result = scheduler.start_backup().await;
                if let Err(e) = &result {
                    warn!("Backup not started: {}", e);
                }
                let _ = reply.send(result);
            }
            Command::Preferences { reply } => {
                let _ = reply.send(scheduler.settings().snapshot().await);
            }
            Command::UpdatePreferences { patch, reply } => {
                debug!("Updating preferences: {:?}", patch);
                scheduler.settings().apply(patch).await;
                let _ = reply.send(scheduler.settings().snapshot().await);
            }
            Command::ResetPreferences { reply } => {
                scheduler.reset_preferences().await;
                let _ = reply.send(scheduler.settings().snapshot().await);
            }
            Command::Shutdown => {}
        }
    }

    /// Runs a single backup and waits for the compressor to finish.
    pub async fn run_once(
        mut scheduler: BackupScheduler,
        marshaler: EventMarshaler<JobEvent>,
        storage: Option<&Storage>,
    ) -> anyhow::Result<ArchiveSummary> {
        scheduler.refresh_tools().await;
        match scheduler.start_backup_with(true).await? {
            StartOutcome::Started(job) => info!("Backup {} started", job),
            StartOutcome::SpawnFailed => anyhow::bail!("Failed to spawn zip process"),
        }

        loop {
            for event in marshaler.drain() {
                if let Some(summary) = scheduler.handle_event(event).await {
                    if let Some(storage) = storage {
                        storage.record_backup(&summary).await?;
                    }
                    return Ok(summary);
                }
            }
            marshaler.notified().await;
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(make(reply))
            .await
            .map_err(|_| ZipBackupError::ControlLoopStopped)?;
        rx.await.map_err(|_| ZipBackupError::ControlLoopStopped)
    }

    pub async fn backup_now(&self) -> Result<StartOutcome> {
        self.request(|reply| Command::BackupNow { reply }).await?
    }

    pub async fn preferences(&self) -> Result<SettingsSnapshot> {
        self.request(|reply| Command::Preferences { reply }).await
    }

    pub async fn update_preferences(&self, patch: SettingsPatch) -> Result<SettingsSnapshot> {
        self.request(|reply| Command::UpdatePreferences { patch, reply }).await
    }

    pub async fn reset_preferences(&self) -> Result<SettingsSnapshot> {
        self.request(|reply| Command::ResetPreferences { reply }).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx
            .send(Command::Shutdown)
            .await
            .map_err(|_| ZipBackupError::ControlLoopStopped)
    }

    pub fn get_status(&self) -> BackupStatus {
        self.status.read().clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<BackupEvent> {
        self.event_tx.subscribe()
    }

    pub fn get_logs(&self, limit: Option<usize>) -> Vec<LogEntry> {
        self.log_buffer.get_logs(limit)
    }

    pub async fn history(&self, limit: i64) -> anyhow::Result<Vec<HistoryEntry>> {
        match &self.storage {
            Some(storage) => storage.history(limit).await,
            None => Ok(Vec::new()),
        }
    }
}
