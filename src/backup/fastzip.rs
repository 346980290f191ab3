use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use tracing::{debug, info};
use walkdir::WalkDir;

use super::tool::{push_paths, ArchiveTool, CommandLine, Platform};
use super::{ToolKind, ToolOptions, ZipFlags};

static FASTZIP_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)fastzip").expect("valid regex"));

/// Fastzip: multi-threaded zip packer, 64 bit Windows only.
///
/// The executable is shipped as an asset somewhere below the asset root, so it is
/// located by name rather than by a fixed path.
pub struct FastZip {
    asset_root: PathBuf,
    platform: Platform,
    located: Mutex<Option<Option<PathBuf>>>,
}

impl FastZip {
    pub fn new(asset_root: impl Into<PathBuf>) -> Self {
        Self::with_platform(asset_root, Platform::current())
    }

    pub fn with_platform(asset_root: impl Into<PathBuf>, platform: Platform) -> Self {
        Self {
            asset_root: asset_root.into(),
            platform,
            located: Mutex::new(None),
        }
    }

    /// Forgets the cached executable location.
    pub fn rescan(&self) {
        *self.located.lock() = None;
    }

    fn search(&self) -> Option<PathBuf> {
        WalkDir::new(&self.asset_root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !entry.file_name().to_string_lossy().starts_with('.'))
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .find(|path| is_fastzip_binary(path))
            .map(|path| std::fs::canonicalize(&path).unwrap_or(path))
    }
}

fn is_fastzip_binary(path: &Path) -> bool {
    let name_matches = path
        .file_stem()
        .map(|stem| FASTZIP_NAME.is_match(&stem.to_string_lossy()))
        .unwrap_or(false);
    let is_exe = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("exe"))
        .unwrap_or(false);
    name_matches && is_exe
}

impl ArchiveTool for FastZip {
    fn kind(&self) -> ToolKind {
        ToolKind::FastZip
    }

    fn executable(&self) -> Option<PathBuf> {
        if !self.platform_supported() {
            return None;
        }
        let mut located = self.located.lock();
        if let Some(Some(path)) = located.as_ref() {
            if path.is_file() {
                return Some(path.clone());
            }
            // searched again by the next refresh, not from here
            debug!("Fastzip moved away from {}", path.display());
            *located = Some(None);
        }
        if located.is_none() {
            let found = self.search();
            if let Some(path) = &found {
                info!("Found Fastzip at {}", path.display());
            }
            *located = Some(found);
        }
        located.clone().flatten()
    }

    fn platform_supported(&self) -> bool {
        self.platform.is_windows() && self.platform.is_64_bit
    }

    fn command_line(&self, program: &Path, output: &Path, sources: &[PathBuf], options: &ToolOptions) -> CommandLine {
        let options = options.normalized();
        let mut cmd = CommandLine::new(program);

        if let Some(level) = options.compression_level {
            cmd.flag(format!("-{}", level));
        }
        if let Some(threads) = options.thread_count {
            cmd.flag(format!("-t{}", threads));
        }
        if let Some(percent) = options.early_out_percent {
            cmd.flag(format!("-e{}", percent));
        }
        if options.flags.contains(ZipFlags::ZIP_MODE) {
            cmd.flag("-z");
        }
        if options.flags.contains(ZipFlags::JUNK_PATHS) {
            cmd.flag("-j");
        }
        if options.flags.contains(ZipFlags::VERBOSE) {
            cmd.flag("-v");
        }

        push_paths(&mut cmd, output, sources);
        cmd
    }

    fn refresh(&self) {
        self.rescan();
        self.executable();
    }
}
