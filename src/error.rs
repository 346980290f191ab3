use std::path::PathBuf;

use crate::backup::ToolKind;

/// Errors raised by the backup pipeline.
///
/// Only configuration problems and an unusable environment reach callers directly;
/// everything that happens after a process is spawned travels as an event instead.
#[derive(Debug, thiserror::Error)]
pub enum ZipBackupError {
    #[error("Invalid output file path")]
    InvalidOutputPath,
    #[error("Need at least one source file")]
    NoSources,
    #[error("{tool} is not supported on this machine")]
    Unsupported { tool: ToolKind },
    #[error("Neither 7-Zip nor Fastzip is available, zip backup won't work")]
    EnvironmentUnavailable,
    #[error("A backup is already running")]
    AlreadyRunning,
    #[error("Host is not ready for a backup")]
    HostNotReady,
    #[error("Backup control loop is not running")]
    ControlLoopStopped,
    #[error("Process was already started")]
    AlreadyStarted,
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Preference error for {key}: {message}")]
    Preference { key: String, message: String },
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ZipBackupError {
    /// Configuration errors fail fast at construction and never start a process.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::InvalidOutputPath | Self::NoSources | Self::Unsupported { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ZipBackupError>;
