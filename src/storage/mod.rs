use std::path::Path;
use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::info;

use crate::backup::ArchiveSummary;
use crate::preferences::PreferenceBackend;

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        let in_memory = database_url.contains(":memory:");
        if !in_memory {
            // Create the parent directory; sqlite creates the file itself
            let path = database_url.strip_prefix("sqlite://").unwrap_or(database_url);
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every connection to :memory: is its own database
        let max_connections = if in_memory { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    pub async fn in_memory() -> Result<Self> {
        let storage = Self::new("sqlite::memory:").await?;
        storage.run_migrations().await?;
        Ok(storage)
    }

    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS preferences (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS backup_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                tool TEXT NOT NULL,
                output_path TEXT NOT NULL,
                exit_code INTEGER NOT NULL,
                size_bytes BIGINT,
                duration_secs REAL NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_history_finished ON backup_history(finished_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn record_backup(&self, summary: &ArchiveSummary) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO backup_history
                (job_id, tool, output_path, exit_code, size_bytes, duration_secs, started_at, finished_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(summary.job.to_string())
        .bind(summary.tool.to_string())
        .bind(summary.output_path.to_string_lossy().to_string())
        .bind(summary.exit_code)
        .bind(summary.size_bytes.map(|s| s as i64))
        .bind(summary.duration_secs)
        .bind(summary.started_at.to_rfc3339())
        .bind(summary.finished_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Most recent first.
    pub async fn history(&self, limit: i64) -> Result<Vec<HistoryEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT job_id, tool, output_path, exit_code, size_bytes, duration_secs, started_at, finished_at
            FROM backup_history
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(HistoryEntry {
                    job_id: row.try_get("job_id")?,
                    tool: row.try_get("tool")?,
                    output_path: row.try_get("output_path")?,
                    exit_code: row.try_get("exit_code")?,
                    size_bytes: row.try_get::<Option<i64>, _>("size_bytes")?.map(|s| s as u64),
                    duration_secs: row.try_get("duration_secs")?,
                    started_at: parse_timestamp(&row.try_get::<String, _>("started_at")?)?,
                    finished_at: parse_timestamp(&row.try_get::<String, _>("finished_at")?)?,
                })
            })
            .collect()
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

#[async_trait]
impl PreferenceBackend for Storage {
    async fn load(&self, key: &str) -> crate::error::Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM preferences WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("value")))
    }

    async fn save(&self, key: &str, value: &str) -> crate::error::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO preferences (key, value, updated_at)
            VALUES (?1, ?2, CURRENT_TIMESTAMP)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> crate::error::Result<()> {
        sqlx::query("DELETE FROM preferences WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub job_id: String,
    pub tool: String,
    pub output_path: String,
    pub exit_code: i32,
    pub size_bytes: Option<u64>,
    pub duration_secs: f64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}
