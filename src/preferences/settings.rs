use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{PreferenceItem, PreferenceStore};
use crate::backup::{ToolKind, ToolOptions, ZipFlags};

/// Auto backups never run more often than this.
pub const MIN_BACKUP_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// 7 days 23 hours 59 minutes.
pub const MAX_BACKUP_INTERVAL: Duration = Duration::from_secs(((7 * 24 + 23) * 60 + 59) * 60);
pub const DEFAULT_BACKUP_INTERVAL: Duration = Duration::from_secs(8 * 60 * 60);

const LAST_BACKUP_KEY: &str = "LastBackup";

fn clamp_interval(secs: u64) -> Duration {
    Duration::from_secs(secs).clamp(MIN_BACKUP_INTERVAL, MAX_BACKUP_INTERVAL)
}

pub fn default_folders() -> Vec<String> {
    vec!["/Assets".to_string(), "/ProjectSettings".to_string()]
}

/// The zip backup preference set.
///
/// `LastBackup` goes through the store directly and is not part of "use defaults".
#[derive(Clone)]
pub struct Settings {
    store: PreferenceStore,
    pub mode: Arc<PreferenceItem<ToolKind>>,
    pub pack_level: Arc<PreferenceItem<i64>>,
    pub early_out: Arc<PreferenceItem<i64>>,
    pub threads: Arc<PreferenceItem<i64>>,
    pub use_custom_save_location: Arc<PreferenceItem<bool>>,
    pub custom_save_location: Arc<PreferenceItem<String>>,
    pub log_to_console: Arc<PreferenceItem<bool>>,
    pub auto_backup: Arc<PreferenceItem<bool>>,
    pub backup_time_span: Arc<PreferenceItem<u64>>,
    pub folders: Arc<PreferenceItem<Vec<String>>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsSnapshot {
    pub mode: ToolKind,
    pub pack_level: i64,
    pub early_out: i64,
    pub threads: i64,
    pub use_custom_save_location: bool,
    pub custom_save_location: String,
    pub log_to_console: bool,
    pub auto_backup: bool,
    pub backup_interval_secs: u64,
    pub folders: Vec<String>,
    pub folders_configured: bool,
}

/// Partial update; absent fields are left alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsPatch {
    pub mode: Option<ToolKind>,
    pub pack_level: Option<i64>,
    pub early_out: Option<i64>,
    pub threads: Option<i64>,
    pub use_custom_save_location: Option<bool>,
    pub custom_save_location: Option<String>,
    pub log_to_console: Option<bool>,
    pub auto_backup: Option<bool>,
    pub backup_interval_secs: Option<u64>,
    pub folders: Option<Vec<String>>,
}

impl Settings {
    pub fn initialize(store: &PreferenceStore, default_mode: ToolKind) -> Self {
        Self {
            store: store.clone(),
            mode: store.item("Mode", default_mode),
            pack_level: store.item("PackLevel", 1),
            early_out: store.item("EarlyOut", 98),
            threads: store.item("Threads", num_cpus::get() as i64),
            use_custom_save_location: store.item("UseCustomSaveLocation", false),
            custom_save_location: store.item("CustomSaveLocation", String::new()),
            log_to_console: store.item("LogToConsole", true),
            auto_backup: store.item("AutoBackup", false),
            backup_time_span: store.item("BackupTimeSpan", DEFAULT_BACKUP_INTERVAL.as_secs()),
            folders: store.item("Folders", default_folders()),
        }
    }

    pub fn store(&self) -> &PreferenceStore {
        &self.store
    }

    pub async fn backup_interval(&self) -> Duration {
        clamp_interval(self.backup_time_span.get().await)
    }

    pub async fn tool_options(&self) -> ToolOptions {
        ToolOptions::new(
            self.pack_level.get().await,
            self.threads.get().await,
            self.early_out.get().await,
            ZipFlags::default(),
        )
    }

    /// The custom destination, if it is enabled and set.
    pub async fn custom_destination(&self) -> Option<String> {
        if !self.use_custom_save_location.get().await {
            return None;
        }
        Some(self.custom_save_location.get().await).filter(|s| !s.trim().is_empty())
    }

    pub async fn last_backup(&self) -> Option<DateTime<Utc>> {
        self.store.get(LAST_BACKUP_KEY, None).await
    }

    pub async fn set_last_backup(&self, at: DateTime<Utc>) {
        if let Err(e) = self.store.set(LAST_BACKUP_KEY, &Some(at)).await {
            warn!("Failed to save last backup time: {}", e);
        }
    }

    pub async fn snapshot(&self) -> SettingsSnapshot {
        SettingsSnapshot {
            mode: self.mode.get().await,
            pack_level: self.pack_level.get().await,
            early_out: self.early_out.get().await,
            threads: self.threads.get().await,
            use_custom_save_location: self.use_custom_save_location.get().await,
            custom_save_location: self.custom_save_location.get().await,
            log_to_console: self.log_to_console.get().await,
            auto_backup: self.auto_backup.get().await,
            backup_interval_secs: self.backup_interval().await.as_secs(),
            folders: self.folders.get().await,
            folders_configured: self.folders.is_persisted().await,
        }
    }

    /// Applies a patch. Turning the custom location off also clears it.
    pub async fn apply(&self, patch: SettingsPatch) {
        if let Some(mode) = patch.mode {
            self.mode.set(mode).await;
        }
        if let Some(level) = patch.pack_level {
            self.pack_level.set(level).await;
        }
        if let Some(early_out) = patch.early_out {
            self.early_out.set(early_out).await;
        }
        if let Some(threads) = patch.threads {
            self.threads.set(threads).await;
        }
        if let Some(location) = patch.custom_save_location {
            self.custom_save_location.set(location).await;
        }
        if let Some(enabled) = patch.use_custom_save_location {
            self.use_custom_save_location.set(enabled).await;
            if !enabled {
                self.custom_save_location.set(String::new()).await;
            }
        }
        if let Some(log) = patch.log_to_console {
            self.log_to_console.set(log).await;
        }
        if let Some(auto) = patch.auto_backup {
            self.auto_backup.set(auto).await;
        }
        if let Some(secs) = patch.backup_interval_secs {
            self.backup_time_span.set(clamp_interval(secs).as_secs()).await;
        }
        if let Some(folders) = patch.folders {
            self.folders.set(folders).await;
        }
    }

    /// "Use defaults": every registered preference goes back to its default.
    pub async fn reset_to_defaults(&self) -> usize {
        self.store.reset_all().await
    }
}
