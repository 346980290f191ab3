pub mod fastzip;
pub mod manager;
pub mod marshal;
pub mod process;
pub mod scheduler;
pub mod sevenzip;
pub mod tool;

pub use fastzip::FastZip;
pub use manager::BackupManager;
pub use marshal::{EventMarshaler, MarshalHandle};
pub use process::ZipProcess;
pub use scheduler::BackupScheduler;
pub use sevenzip::SevenZip;
pub use tool::{ArchiveTool, CommandLine, Platform, ToolCapability, ToolRegistry};

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// The two interchangeable compressors. Fastzip is preferred, 7-Zip is the fallback.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ToolKind {
    #[serde(alias = "fastzip")]
    FastZip,
    #[serde(alias = "7zip", alias = "sevenzip")]
    SevenZip,
}

impl ToolKind {
    pub const ALL: [ToolKind; 2] = [ToolKind::FastZip, ToolKind::SevenZip];
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolKind::FastZip => f.write_str("Fastzip"),
            ToolKind::SevenZip => f.write_str("7-Zip"),
        }
    }
}

bitflags! {
    /// Mode switches understood by Fastzip.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ZipFlags: u8 {
        const ZIP_MODE = 1 << 0;
        const JUNK_PATHS = 1 << 1;
        const VERBOSE = 1 << 2;
    }
}

impl Default for ZipFlags {
    fn default() -> Self {
        ZipFlags::ZIP_MODE | ZipFlags::JUNK_PATHS
    }
}

/// Structured compressor options. `None` means "let the tool decide".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOptions {
    pub compression_level: Option<u8>,
    pub thread_count: Option<u32>,
    pub early_out_percent: Option<u8>,
    pub flags: ZipFlags,
}

impl ToolOptions {
    /// Builds options from raw values, dropping anything outside its valid range.
    pub fn new(compression_level: i64, thread_count: i64, early_out_percent: i64, flags: ZipFlags) -> Self {
        Self {
            compression_level: (0..=9)
                .contains(&compression_level)
                .then_some(compression_level as u8),
            thread_count: (1..=i64::from(u32::MAX))
                .contains(&thread_count)
                .then_some(thread_count as u32),
            early_out_percent: (0..=100)
                .contains(&early_out_percent)
                .then_some(early_out_percent as u8),
            flags,
        }
    }

    /// Re-applies the range rules to values set directly on the fields.
    pub fn normalized(self) -> Self {
        Self {
            compression_level: self.compression_level.filter(|l| *l <= 9),
            thread_count: self.thread_count.filter(|t| *t >= 1),
            early_out_percent: self.early_out_percent.filter(|p| *p <= 100),
            flags: self.flags,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One invocation of a compressor against a fixed set of sources.
#[derive(Debug, Clone)]
pub struct ArchiveJob {
    pub id: JobId,
    pub output_path: PathBuf,
    pub source_paths: Vec<PathBuf>,
    pub tool: ToolKind,
    pub options: ToolOptions,
}

impl ArchiveJob {
    pub fn new(output_path: impl Into<PathBuf>, source_paths: Vec<PathBuf>, tool: ToolKind, options: ToolOptions) -> Self {
        Self {
            id: JobId::new(),
            output_path: output_path.into(),
            source_paths,
            tool,
            options: options.normalized(),
        }
    }
}

/// How the external process ended. `code` is `None` when it was killed by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitOutcome {
    pub code: Option<i32>,
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn code_or_default(&self) -> i32 {
        self.code.unwrap_or(-1)
    }
}

/// Raised by the reader tasks of a running job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Output(String),
    Error(String),
    Exited(ExitOutcome),
}

/// A process event tagged with its job, as it travels through the marshaler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEvent {
    pub job: JobId,
    pub event: ProcessEvent,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackupState {
    Idle,
    Running,
}

/// Telemetry of a finished archive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArchiveSummary {
    pub job: JobId,
    pub tool: ToolKind,
    pub output_path: PathBuf,
    pub exit_code: i32,
    pub size_bytes: Option<u64>,
    pub duration_secs: f64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ArchiveSummary {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Events published to observers outside the control loop.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackupEvent {
    Started { job: JobId, tool: ToolKind, output_path: PathBuf },
    Output { job: JobId, line: String },
    ErrorOutput { job: JobId, line: String },
    Finished(ArchiveSummary),
    SpawnFailed { message: String },
    AutoBackupSuspended { message: String },
    PreferencesReset,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_flags_match_fastzip_defaults() {
        let flags = ZipFlags::default();
        assert!(flags.contains(ZipFlags::ZIP_MODE));
        assert!(flags.contains(ZipFlags::JUNK_PATHS));
        assert!(!flags.contains(ZipFlags::VERBOSE));
    }

    #[test]
    fn test_options_keep_boundaries() {
        let options = ToolOptions::new(0, 1, 100, ZipFlags::empty());
        assert_eq!(options.compression_level, Some(0));
        assert_eq!(options.thread_count, Some(1));
        assert_eq!(options.early_out_percent, Some(100));

        let options = ToolOptions::new(9, 64, 0, ZipFlags::empty());
        assert_eq!(options.compression_level, Some(9));
        assert_eq!(options.early_out_percent, Some(0));
    }

    #[test]
    fn test_normalized_drops_direct_out_of_range_fields() {
        let options = ToolOptions {
            compression_level: Some(12),
            thread_count: Some(0),
            early_out_percent: Some(101),
            flags: ZipFlags::VERBOSE,
        }
        .normalized();
        assert_eq!(options.compression_level, None);
        assert_eq!(options.thread_count, None);
        assert_eq!(options.early_out_percent, None);
        assert_eq!(options.flags, ZipFlags::VERBOSE);
    }

    #[test]
    fn test_exit_outcome_without_code_is_failure() {
        let killed = ExitOutcome { code: None };
        assert!(!killed.success());
        assert_eq!(killed.code_or_default(), -1);
        assert!(ExitOutcome { code: Some(0) }.success());
    }

    #[test]
    fn test_tool_kind_accepts_legacy_names() {
        let kind: ToolKind = serde_json::from_str("\"7zip\"").unwrap();
        assert_eq!(kind, ToolKind::SevenZip);
        let kind: ToolKind = serde_json::from_str("\"FastZip\"").unwrap();
        assert_eq!(kind, ToolKind::FastZip);
    }

    proptest! {
        #[test]
        fn prop_out_of_range_level_is_unset(level in prop_oneof![i64::MIN..0i64, 10i64..i64::MAX]) {
            let options = ToolOptions::new(level, 4, 90, ZipFlags::default());
            prop_assert_eq!(options.compression_level, None);
            prop_assert_eq!(options.thread_count, Some(4));
        }

        #[test]
        fn prop_in_range_values_survive(level in 0i64..=9, threads in 1i64..=256, early in 0i64..=100) {
            let options = ToolOptions::new(level, threads, early, ZipFlags::empty());
            prop_assert_eq!(options.compression_level, Some(level as u8));
            prop_assert_eq!(options.thread_count, Some(threads as u32));
            prop_assert_eq!(options.early_out_percent, Some(early as u8));
        }

        #[test]
        fn prop_out_of_range_early_out_is_unset(early in prop_oneof![i64::MIN..0i64, 101i64..i64::MAX]) {
            let options = ToolOptions::new(5, 4, early, ZipFlags::default());
            prop_assert_eq!(options.early_out_percent, None);
        }
    }
}
