use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, error, info, warn};

use super::marshal::MarshalHandle;
use super::process::ZipProcess;
use super::tool::{ToolCapability, ToolRegistry};
use super::{
    ArchiveJob, ArchiveSummary, BackupEvent, BackupState, ExitOutcome, JobEvent, JobId, ProcessEvent, ToolKind,
    ToolOptions,
};
use crate::error::{Result, ZipBackupError};
use crate::preferences::Settings;
use crate::utils::config::Config;
use crate::utils::{Clock, LogBuffer, SystemClock};

/// Whether the host is in a state where a backup may start.
pub trait HostReadiness: Send + Sync {
    fn is_ready(&self) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysReady;

impl HostReadiness for AlwaysReady {
    fn is_ready(&self) -> bool {
        true
    }
}

impl<F> HostReadiness for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_ready(&self) -> bool {
        self()
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub project_root: PathBuf,
    pub product_name: String,
    pub advance_on_spawn_failure: bool,
}

impl From<&Config> for SchedulerConfig {
    fn from(config: &Config) -> Self {
        Self {
            project_root: config.project_root.clone(),
            product_name: config.product_name.clone(),
            advance_on_spawn_failure: config.advance_on_spawn_failure,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started(JobId),
    /// Reported through a `SpawnFailed` event; the scheduler is idle again.
    SpawnFailed,
}

struct ActiveJob {
    process: ZipProcess,
    started_at: DateTime<Utc>,
    started: Instant,
}

/// Decides when a backup is due and drives the compressor for it.
///
/// Lives on the control loop. Events for observers pile up until
/// [`take_events`](Self::take_events) is called.
pub struct BackupScheduler {
    settings: Settings,
    registry: Arc<ToolRegistry>,
    clock: Arc<dyn Clock>,
    readiness: Arc<dyn HostReadiness>,
    config: SchedulerConfig,
    marshal: MarshalHandle<JobEvent>,
    logs: LogBuffer,
    active: Option<ActiveJob>,
    auto_suspended: bool,
    last_summary: Option<ArchiveSummary>,
    tools: Vec<ToolCapability>,
    tool_warnings: Vec<String>,
    events: Vec<BackupEvent>,
}

impl BackupScheduler {
    pub fn new(
        settings: Settings,
        registry: Arc<ToolRegistry>,
        marshal: MarshalHandle<JobEvent>,
        config: SchedulerConfig,
    ) -> Self {
        let tools = registry.capabilities();
        let tool_warnings = registry.availability_warnings();
        Self {
            settings,
            registry,
            clock: Arc::new(SystemClock),
            readiness: Arc::new(AlwaysReady),
            config,
            marshal,
            logs: LogBuffer::default(),
            active: None,
            auto_suspended: false,
            last_summary: None,
            tools,
            tool_warnings,
            events: Vec::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_readiness(mut self, readiness: Arc<dyn HostReadiness>) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn with_logs(mut self, logs: LogBuffer) -> Self {
        self.logs = logs;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Tool availability as of the last lookup.
    pub fn tools(&self) -> &[ToolCapability] {
        &self.tools
    }

    pub fn tool_warnings(&self) -> &[String] {
        &self.tool_warnings
    }

    /// Looks the executables up again, off the runtime.
    pub async fn refresh_tools(&mut self) {
        self.registry.refresh().await;
        self.capture_tools();
    }

    fn capture_tools(&mut self) {
        self.tools = self.registry.capabilities();
        self.tool_warnings = self.registry.availability_warnings();
    }

    pub fn logs(&self) -> &LogBuffer {
        &self.logs
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn state(&self) -> BackupState {
        if self.active.is_some() {
            BackupState::Running
        } else {
            BackupState::Idle
        }
    }

    pub fn active_job(&self) -> Option<JobId> {
        self.active.as_ref().map(|a| a.process.id())
    }

    pub fn active_output(&self) -> Option<&Path> {
        self.active.as_ref().map(|a| a.process.job().output_path.as_path())
    }

    pub fn auto_suspended(&self) -> bool {
        self.auto_suspended
    }

    pub fn last_summary(&self) -> Option<&ArchiveSummary> {
        self.last_summary.as_ref()
    }

    pub fn take_events(&mut self) -> Vec<BackupEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn can_backup(&self) -> bool {
        self.active.is_none() && self.registry.any_supported() && self.readiness.is_ready()
    }

    /// When the next automatic backup is due, or `None` when auto backup is off.
    pub async fn next_backup(&self) -> Option<DateTime<Utc>> {
        let last = self.settings.last_backup().await;
        self.next_backup_after(last).await
    }

    /// Same as [`next_backup`](Self::next_backup) for an already loaded `last_backup`.
    pub async fn next_backup_after(&self, last: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        if self.auto_suspended || !self.settings.auto_backup.get().await {
            return None;
        }
        match last {
            Some(last) => due_at(last, self.settings.backup_interval().await),
            None => Some(self.clock.now()),
        }
    }

    /// `<product>_backup_<yyyyMMdd-HHmmss>.zip`
    pub fn archive_file_name(&self, at: DateTime<Utc>) -> String {
        format!(
            "{}_backup_{}.zip",
            sanitize_file_name(&self.config.product_name),
            at.format("%Y%m%d-%H%M%S")
        )
    }

    pub async fn save_location(&self) -> PathBuf {
        match self.settings.custom_destination().await {
            Some(custom) => PathBuf::from(custom),
            None => self.config.project_root.join("Backups"),
        }
    }

    /// Configured folders as absolute paths under the project root.
    pub async fn resolve_sources(&self) -> Vec<PathBuf> {
        self.settings
            .folders
            .get()
            .await
            .iter()
            .filter(|f| !f.trim().is_empty())
            .map(|f| self.config.project_root.join(f.trim_start_matches(['/', '\\'])))
            .collect()
    }

    /// Starts a backup right away.
    ///
    /// Refusals and configuration problems are returned and change nothing. A spawn
    /// failure is reported as an event instead.
    pub async fn start_backup(&mut self) -> Result<StartOutcome> {
        self.start_backup_with(false).await
    }

    /// With `wait_for_exit` the call returns only after the compressor ended; its
    /// events are then already queued on the marshaler.
    pub async fn start_backup_with(&mut self, wait_for_exit: bool) -> Result<StartOutcome> {
        if self.active.is_some() {
            return Err(ZipBackupError::AlreadyRunning);
        }
        if !self.registry.any_supported() {
            return Err(ZipBackupError::EnvironmentUnavailable);
        }
        if !self.readiness.is_ready() {
            return Err(ZipBackupError::HostNotReady);
        }

        let preferred = self.settings.mode.get().await;
        let kind = self
            .registry
            .select(preferred)
            .ok_or(ZipBackupError::EnvironmentUnavailable)?;
        let tool = self
            .registry
            .get(kind)
            .ok_or(ZipBackupError::Unsupported { tool: kind })?;
        if kind != preferred {
            debug!("{} is not usable, falling back to {}", preferred, kind);
        }

        // 7-Zip runs with its own defaults
        let options = match kind {
            ToolKind::FastZip => self.settings.tool_options().await,
            ToolKind::SevenZip => ToolOptions::default(),
        };

        let now = self.clock.now();
        let output = self.save_location().await.join(self.archive_file_name(now));
        let sources = self.resolve_sources().await;
        let job = ArchiveJob::new(output, sources, kind, options);
        let mut process = ZipProcess::new(tool, job, self.marshal.clone())?;
        let log_to_console = self.settings.log_to_console.get().await;

        match process.start_with(wait_for_exit).await {
            Ok(_) => {
                let job = process.id();
                let output_path = process.job().output_path.clone();
                if log_to_console {
                    info!("Backing up with {} into {}", kind, output_path.display());
                }
                self.logs.add_log("info", "Backing up...", Some(job));
                self.events.push(BackupEvent::Started {
                    job,
                    tool: kind,
                    output_path,
                });
                self.active = Some(ActiveJob {
                    process,
                    started_at: now,
                    started: Instant::now(),
                });
                Ok(StartOutcome::Started(job))
            }
            Err(e) => {
                warn!("Failed to spawn zip process: {}", e);
                self.logs.add_log("warn", format!("Failed to spawn zip process: {}", e), None);
                if self.config.advance_on_spawn_failure {
                    self.settings.set_last_backup(now).await;
                }
                self.events.push(BackupEvent::SpawnFailed { message: e.to_string() });
                Ok(StartOutcome::SpawnFailed)
            }
        }
    }

    /// "Use defaults" for every preference; the last backup time is kept.
    pub async fn reset_preferences(&mut self) -> usize {
        let count = self.settings.reset_to_defaults().await;
        info!("Reset {} preferences to their defaults", count);
        self.events.push(BackupEvent::PreferencesReset);
        count
    }

    /// Periodic check. Anything going wrong in here turns auto backup off for the session.
    pub async fn poll(&mut self) {
        if self.auto_suspended || self.active.is_some() {
            return;
        }
        if let Err(e) = self.check_auto_backup().await {
            error!("Auto backup failed: {}", e);
            warn!("Disabling auto backup for this session, if the error persists check the settings");
            self.auto_suspended = true;
            self.logs
                .add_log("error", format!("Auto backup suspended: {}", e), None);
            self.events.push(BackupEvent::AutoBackupSuspended { message: e.to_string() });
        }
    }

    async fn check_auto_backup(&mut self) -> Result<()> {
        if !self.settings.auto_backup.get().await || !self.can_backup() {
            return Ok(());
        }
        let interval = self.settings.backup_interval().await;
        let due = match self.settings.last_backup().await {
            Some(last) => due_at(last, interval).is_some_and(|at| self.clock.now() > at),
            None => true,
        };
        if due {
            debug!("Auto backup is due");
            self.start_backup().await?;
        }
        Ok(())
    }

    /// Handles one marshaled process event. Returns the summary once the job ended.
    pub async fn handle_event(&mut self, event: JobEvent) -> Option<ArchiveSummary> {
        let Some(active) = self.active.as_mut().filter(|a| a.process.id() == event.job) else {
            debug!("Dropping event for inactive job {}", event.job);
            return None;
        };
        active.process.dispatch(&event.event);

        match event.event {
            ProcessEvent::Output(line) => {
                if self.settings.log_to_console.get().await {
                    info!("{}", line);
                }
                self.logs.add_log("info", line.clone(), Some(event.job));
                self.events.push(BackupEvent::Output { job: event.job, line });
                None
            }
            ProcessEvent::Error(line) => {
                error!("Zip Error: {}", line);
                self.logs.add_log("error", line.clone(), Some(event.job));
                self.events.push(BackupEvent::ErrorOutput { job: event.job, line });
                None
            }
            ProcessEvent::Exited(outcome) => {
                let active = self.active.take()?;
                Some(self.finish(active, outcome).await)
            }
        }
    }

    async fn finish(&mut self, active: ActiveJob, outcome: ExitOutcome) -> ArchiveSummary {
        let elapsed = active.started.elapsed();
        let job = active.process.job().clone();
        let started_at = active.started_at;
        let finished_at = self.clock.now();
        self.settings.set_last_backup(finished_at).await;

        let size_bytes = if outcome.success() {
            tokio::fs::metadata(&job.output_path).await.ok().map(|m| m.len())
        } else {
            None
        };
        let summary = ArchiveSummary {
            job: job.id,
            tool: job.tool,
            output_path: job.output_path,
            exit_code: outcome.code_or_default(),
            size_bytes,
            duration_secs: elapsed.as_secs_f64(),
            started_at,
            finished_at,
        };

        if summary.succeeded() {
            let message = format!(
                "Backed up project into {} in {:.2} seconds",
                format_bytes(summary.size_bytes.unwrap_or(0)),
                summary.duration_secs
            );
            if self.settings.log_to_console.get().await {
                info!("{}", message);
            }
            self.logs.add_log("info", message, Some(summary.job));
        } else {
            let message = format!(
                "Something went wrong while zipping, process exited with code {}",
                summary.exit_code
            );
            warn!("{}", message);
            self.logs.add_log("warn", message, Some(summary.job));
        }

        self.capture_tools();
        self.last_summary = Some(summary.clone());
        self.events.push(BackupEvent::Finished(summary.clone()));
        summary
    }
}

/// `last + interval`, or `None` past the representable range.
pub fn due_at(last: DateTime<Utc>, interval: std::time::Duration) -> Option<DateTime<Utc>> {
    ChronoDuration::from_std(interval)
        .ok()
        .and_then(|interval| last.checked_add_signed(interval))
}

/// Replaces characters that can't appear in a file name.
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '-',
            c if c.is_control() => '-',
            c => c,
        })
        .collect();
    if cleaned.trim().is_empty() {
        "Project".to_string()
    } else {
        cleaned
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{} bytes", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}
