use std::path::{Path, PathBuf};

use super::tool::{push_paths, ArchiveTool, CommandLine, Platform};
use super::{ToolKind, ToolOptions};

/// 7-Zip, found at a fixed location inside the tools directory.
pub struct SevenZip {
    tools_dir: PathBuf,
    platform: Platform,
}

impl SevenZip {
    pub fn new(tools_dir: impl Into<PathBuf>) -> Self {
        Self::with_platform(tools_dir, Platform::current())
    }

    pub fn with_platform(tools_dir: impl Into<PathBuf>, platform: Platform) -> Self {
        Self {
            tools_dir: tools_dir.into(),
            platform,
        }
    }

    pub fn expected_path(&self) -> PathBuf {
        let mut path = self.tools_dir.join("7z");
        let ext = self.platform.exe_extension();
        if !ext.is_empty() {
            path.set_extension(ext);
        }
        path
    }
}

impl ArchiveTool for SevenZip {
    fn kind(&self) -> ToolKind {
        ToolKind::SevenZip
    }

    fn executable(&self) -> Option<PathBuf> {
        let path = self.expected_path();
        path.is_file().then_some(path)
    }

    fn platform_supported(&self) -> bool {
        true
    }

    fn command_line(&self, program: &Path, output: &Path, sources: &[PathBuf], options: &ToolOptions) -> CommandLine {
        let options = options.normalized();
        let mut cmd = CommandLine::new(program);
        cmd.flag("a").flag("-tzip").flag("-bd");

        if let Some(level) = options.compression_level {
            cmd.flag(format!("-mx{}", level));
        }
        if let Some(threads) = options.thread_count {
            cmd.flag(format!("-mmt{}", threads));
        }

        push_paths(&mut cmd, output, sources);
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::ZipFlags;
    use tempfile::TempDir;

    #[test]
    fn test_default_arguments() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("Assets");
        std::fs::create_dir(&src).unwrap();
        let output = dir.path().join("out.zip");

        let tool = SevenZip::new(dir.path());
        let cmd = tool.command_line(Path::new("7z"), &output, &[src.clone()], &ToolOptions::default());
        assert_eq!(
            cmd.arguments(),
            format!("a -tzip -bd \"{}\" \"{}\"", output.display(), src.display())
        );
    }

    #[test]
    fn test_level_and_threads_when_set() {
        let dir = TempDir::new().unwrap();
        let tool = SevenZip::new(dir.path());
        let args = tool.build_args(
            &dir.path().join("out.zip"),
            &[dir.path().to_path_buf()],
            &ToolOptions::new(9, 2, 50, ZipFlags::all()),
        );
        assert_eq!(&args[..5], &["a", "-tzip", "-bd", "-mx9", "-mmt2"]);
        assert_eq!(args.len(), 7);
    }

    #[test]
    fn test_fixed_location_lookup() {
        let dir = TempDir::new().unwrap();
        let windows = SevenZip::with_platform(dir.path(), Platform::windows_64());
        assert!(windows.executable().is_none());
        assert!(!windows.is_supported());

        std::fs::write(dir.path().join("7z.exe"), b"MZ").unwrap();
        assert_eq!(windows.executable(), Some(dir.path().join("7z.exe")));
        assert!(windows.is_supported());

        let linux = SevenZip::with_platform(
            dir.path(),
            Platform {
                os: "linux".to_string(),
                is_64_bit: true,
            },
        );
        assert!(linux.executable().is_none());
    }
}
