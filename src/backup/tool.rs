use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use super::{ToolKind, ToolOptions};

/// Operating system facts the tools gate themselves on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub is_64_bit: bool,
}

impl Platform {
    pub fn current() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            is_64_bit: cfg!(target_pointer_width = "64"),
        }
    }

    pub fn windows_64() -> Self {
        Self {
            os: "windows".to_string(),
            is_64_bit: true,
        }
    }

    pub fn is_windows(&self) -> bool {
        self.os == "windows"
    }

    /// Extension of native executables, without the dot.
    pub fn exe_extension(&self) -> &'static str {
        if self.is_windows() {
            "exe"
        } else {
            ""
        }
    }
}

/// A resolved program plus its arguments.
///
/// Arguments are kept unquoted for spawning; `Display` renders the quoted form
/// `flags "output" "source"...` used in logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: PathBuf,
    pub args: Vec<String>,
    quoted_from: usize,
}

impl CommandLine {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            quoted_from: usize::MAX,
        }
    }

    pub fn flag(&mut self, flag: impl Into<String>) -> &mut Self {
        self.args.push(flag.into());
        self
    }

    /// Appends a path argument. Every path from here on renders quoted.
    pub fn path(&mut self, path: &Path) -> &mut Self {
        self.quoted_from = self.quoted_from.min(self.args.len());
        self.args.push(path.to_string_lossy().into_owned());
        self
    }

    /// The argument string as it would be typed in a shell.
    pub fn arguments(&self) -> String {
        self.args
            .iter()
            .enumerate()
            .map(|(i, arg)| {
                if i >= self.quoted_from {
                    format!("\"{}\"", arg)
                } else {
                    arg.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.program.display(), self.arguments())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolCapability {
    pub tool: ToolKind,
    pub supported: bool,
    pub executable: Option<PathBuf>,
}

/// A compressor strategy: finds its executable and translates options into arguments.
pub trait ArchiveTool: Send + Sync {
    fn kind(&self) -> ToolKind;

    /// Absolute path of the executable, `None` when it can't be found.
    fn executable(&self) -> Option<PathBuf>;

    /// Platform constraints, independent of whether the executable exists.
    fn platform_supported(&self) -> bool;

    /// Arguments for compressing `sources` into `output`.
    fn build_args(&self, output: &Path, sources: &[PathBuf], options: &ToolOptions) -> Vec<String> {
        self.command_line(Path::new(""), output, sources, options).args
    }

    fn command_line(&self, program: &Path, output: &Path, sources: &[PathBuf], options: &ToolOptions) -> CommandLine;

    fn is_supported(&self) -> bool {
        self.platform_supported() && self.executable().is_some()
    }

    /// Redoes any cached lookup. May block on the filesystem.
    fn refresh(&self) {}

    fn capability(&self) -> ToolCapability {
        let executable = self.executable();
        ToolCapability {
            tool: self.kind(),
            supported: self.platform_supported() && executable.is_some(),
            executable,
        }
    }
}

/// Appends the output path, then every source that exists right now, in order.
pub(crate) fn push_paths(cmd: &mut CommandLine, output: &Path, sources: &[PathBuf]) {
    cmd.path(output);
    for source in sources {
        if source.is_dir() || source.is_file() {
            cmd.path(source);
        } else {
            debug!("Skipping missing source {}", source.display());
        }
    }
}

/// Lookup table of the available strategies keyed by tool.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<ToolKind, Arc<dyn ArchiveTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(mut self, tool: Arc<dyn ArchiveTool>) -> Self {
        self.register(tool);
        self
    }

    pub fn register(&mut self, tool: Arc<dyn ArchiveTool>) {
        self.tools.insert(tool.kind(), tool);
    }

    pub fn get(&self, kind: ToolKind) -> Option<Arc<dyn ArchiveTool>> {
        self.tools.get(&kind).cloned()
    }

    pub fn capability(&self, kind: ToolKind) -> ToolCapability {
        match self.tools.get(&kind) {
            Some(tool) => tool.capability(),
            None => ToolCapability {
                tool: kind,
                supported: false,
                executable: None,
            },
        }
    }

    /// Re-runs every tool's executable lookup on the blocking pool.
    pub async fn refresh(&self) {
        let tools: Vec<Arc<dyn ArchiveTool>> = self.tools.values().cloned().collect();
        let lookup = tokio::task::spawn_blocking(move || {
            for tool in &tools {
                tool.refresh();
            }
        });
        if let Err(e) = lookup.await {
            warn!("Tool lookup task failed: {}", e);
        }
    }

    pub fn capabilities(&self) -> Vec<ToolCapability> {
        ToolKind::ALL.iter().map(|kind| self.capability(*kind)).collect()
    }

    pub fn is_supported(&self, kind: ToolKind) -> bool {
        self.tools.get(&kind).map(|t| t.is_supported()).unwrap_or(false)
    }

    pub fn any_supported(&self) -> bool {
        ToolKind::ALL.iter().any(|kind| self.is_supported(*kind))
    }

    /// The preferred tool when usable, otherwise whichever one is.
    pub fn select(&self, preferred: ToolKind) -> Option<ToolKind> {
        if self.is_supported(preferred) {
            return Some(preferred);
        }
        ToolKind::ALL
            .iter()
            .copied()
            .find(|kind| *kind != preferred && self.is_supported(*kind))
    }

    /// Mode used when nothing was configured yet.
    pub fn default_mode(&self) -> ToolKind {
        if self.is_supported(ToolKind::FastZip) {
            ToolKind::FastZip
        } else {
            ToolKind::SevenZip
        }
    }

    /// Human readable availability problems, worst first.
    pub fn availability_warnings(&self) -> Vec<String> {
        let fast = self.is_supported(ToolKind::FastZip);
        let seven = self.is_supported(ToolKind::SevenZip);
        match (fast, seven) {
            (false, false) => vec!["7-Zip and Fastzip aren't supported, zip backup won't work".to_string()],
            (false, true) => vec![
                "Fastzip isn't supported, either Fastzip.exe was not found or this is not 64 bit Windows".to_string(),
            ],
            (true, false) => vec!["7z was not found, 7-Zip won't work".to_string()],
            (true, true) => Vec::new(),
        }
    }
}
