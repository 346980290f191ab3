use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server port
    pub port: u16,

    /// Database URL
    pub database_url: String,

    /// Project whose folders are archived
    pub project_root: PathBuf,

    /// Used as the archive file name prefix
    pub product_name: String,

    /// Directory holding 7z / 7z.exe
    pub tools_dir: PathBuf,

    /// Where to look for the Fastzip executable
    pub asset_root: PathBuf,

    /// Control loop tick
    #[serde(with = "duration_str")]
    pub tick: Duration,

    /// Whether a failed spawn still counts as a backup attempt
    pub advance_on_spawn_failure: bool,
}

mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

impl Default for Config {
    fn default() -> Self {
        let project_root = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let product_name = project_name(&project_root);
        let database_url = dirs::data_dir()
            .map(|d| d.join("zip-backup").join("zip_backup.db"))
            .map(|p| format!("sqlite://{}", p.display()))
            .unwrap_or_else(|| "sqlite://zip_backup.db".to_string());

        Self {
            port: 8890,
            database_url,
            tools_dir: project_root.join("Tools").join("7zip"),
            asset_root: project_root.join("Assets"),
            project_root,
            product_name,
            tick: Duration::from_secs(1),
            advance_on_spawn_failure: true,
        }
    }
}

fn project_name(root: &Path) -> String {
    root.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "Project".to_string())
}

impl Config {
    /// Load config from `.env` and the environment
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Config::default();

        if let Some(port) = lookup("ZIP_BACKUP_PORT") {
            config.port = port.parse().context("ZIP_BACKUP_PORT")?;
        }

        if let Some(db_url) = lookup("DATABASE_URL") {
            config.database_url = db_url;
        }

        if let Some(root) = lookup("ZIP_BACKUP_PROJECT_ROOT") {
            let root = PathBuf::from(root);
            config.product_name = project_name(&root);
            config.tools_dir = root.join("Tools").join("7zip");
            config.asset_root = root.join("Assets");
            config.project_root = root;
        }

        if let Some(name) = lookup("ZIP_BACKUP_PRODUCT_NAME") {
            config.product_name = name;
        }

        if let Some(dir) = lookup("ZIP_BACKUP_TOOLS_DIR") {
            config.tools_dir = PathBuf::from(dir);
        }

        if let Some(dir) = lookup("ZIP_BACKUP_ASSET_ROOT") {
            config.asset_root = PathBuf::from(dir);
        }

        if let Some(tick) = lookup("ZIP_BACKUP_TICK") {
            config.tick = humantime::parse_duration(&tick).context("ZIP_BACKUP_TICK")?;
        }

        if let Some(advance) = lookup("ZIP_BACKUP_ADVANCE_ON_SPAWN_FAILURE") {
            config.advance_on_spawn_failure = advance.parse().context("ZIP_BACKUP_ADVANCE_ON_SPAWN_FAILURE")?;
        }

        Ok(config)
    }
}

pub fn load_config() -> Result<Config> {
    Config::load()
}
