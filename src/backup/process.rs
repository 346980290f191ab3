use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use super::marshal::MarshalHandle;
use super::tool::{ArchiveTool, CommandLine};
use super::{ArchiveJob, ExitOutcome, JobEvent, JobId, ProcessEvent};
use crate::error::{Result, ZipBackupError};

pub type LineHook = Arc<dyn Fn(&str) + Send + Sync>;
pub type ExitHook = Arc<dyn Fn(ExitOutcome) + Send + Sync>;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Hooks that run on the reader tasks, as soon as a line is read.
#[derive(Clone, Default)]
struct ThreadedHooks {
    output: Vec<LineHook>,
    error: Vec<LineHook>,
    exit: Vec<ExitHook>,
}

/// Hooks that run on the control loop when the marshaled event is dispatched.
#[derive(Default)]
struct MarshaledHooks {
    output: Vec<Box<dyn FnMut(&str) + Send + Sync>>,
    error: Vec<Box<dyn FnMut(&str) + Send + Sync>>,
    exit: Vec<Box<dyn FnMut(ExitOutcome) + Send + Sync>>,
}

/// The spawned OS process as seen from the control loop.
pub struct ProcessHandle {
    pub pid: Option<u32>,
    pub exit: Option<ExitOutcome>,
    exit_rx: Option<oneshot::Receiver<ExitOutcome>>,
}

/// Supervises one external compressor run.
///
/// Output and error lines are read on background tasks. Each line first goes to the
/// threaded hooks, then is posted to the marshaler; the control loop hands it back
/// through [`ZipProcess::dispatch`], which runs the marshaled hooks. The exit event is
/// posted after both streams are drained.
pub struct ZipProcess {
    job: ArchiveJob,
    tool: Arc<dyn ArchiveTool>,
    program: PathBuf,
    marshal: MarshalHandle<JobEvent>,
    threaded: ThreadedHooks,
    marshaled: MarshaledHooks,
    handle: Option<ProcessHandle>,
}

impl ZipProcess {
    pub fn new(tool: Arc<dyn ArchiveTool>, job: ArchiveJob, marshal: MarshalHandle<JobEvent>) -> Result<Self> {
        if job.output_path.as_os_str().is_empty() {
            return Err(ZipBackupError::InvalidOutputPath);
        }
        if job.source_paths.is_empty() {
            return Err(ZipBackupError::NoSources);
        }
        let program = match (tool.platform_supported(), tool.executable()) {
            (true, Some(program)) => program,
            _ => return Err(ZipBackupError::Unsupported { tool: tool.kind() }),
        };

        Ok(Self {
            job,
            tool,
            program,
            marshal,
            threaded: ThreadedHooks::default(),
            marshaled: MarshaledHooks::default(),
            handle: None,
        })
    }

    pub fn job(&self) -> &ArchiveJob {
        &self.job
    }

    pub fn id(&self) -> JobId {
        self.job.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().and_then(|h| h.pid)
    }

    pub fn is_started(&self) -> bool {
        self.handle.is_some()
    }

    pub fn exit(&self) -> Option<ExitOutcome> {
        self.handle.as_ref().and_then(|h| h.exit)
    }

    /// The command line as it stands right now; missing sources are already left out.
    pub fn command_line(&self) -> CommandLine {
        self.tool
            .command_line(&self.program, &self.job.output_path, &self.job.source_paths, &self.job.options)
    }

    pub fn on_output_threaded(&mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> &mut Self {
        self.threaded.output.push(Arc::new(hook));
        self
    }

    pub fn on_error_threaded(&mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> &mut Self {
        self.threaded.error.push(Arc::new(hook));
        self
    }

    pub fn on_exit_threaded(&mut self, hook: impl Fn(ExitOutcome) + Send + Sync + 'static) -> &mut Self {
        self.threaded.exit.push(Arc::new(hook));
        self
    }

    pub fn on_output(&mut self, hook: impl FnMut(&str) + Send + Sync + 'static) -> &mut Self {
        self.marshaled.output.push(Box::new(hook));
        self
    }

    pub fn on_error(&mut self, hook: impl FnMut(&str) + Send + Sync + 'static) -> &mut Self {
        self.marshaled.error.push(Box::new(hook));
        self
    }

    pub fn on_exit(&mut self, hook: impl FnMut(ExitOutcome) + Send + Sync + 'static) -> &mut Self {
        self.marshaled.exit.push(Box::new(hook));
        self
    }

    /// Spawns the compressor. Succeeds once the OS accepted the process.
    pub async fn start(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Err(ZipBackupError::AlreadyStarted);
        }

        let cmd_line = self.command_line();
        let output = &self.job.output_path;

        if tokio::fs::metadata(output).await.map(|m| m.is_file()).unwrap_or(false) {
            tokio::fs::remove_file(output).await?;
        }
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.exists() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        debug!("Spawning process: {}", cmd_line);

        let mut cmd = Command::new(&cmd_line.program);
        cmd.args(&cmd_line.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let mut child = cmd.spawn().map_err(|source| ZipBackupError::Spawn {
            program: cmd_line.program.clone(),
            source,
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (stdout, stderr) = match (stdout, stderr) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            _ => {
                let _ = child.start_kill();
                return Err(ZipBackupError::Spawn {
                    program: cmd_line.program,
                    source: std::io::Error::other("output streams were not captured"),
                });
            }
        };

        let job = self.job.id;
        let out_task = tokio::spawn(read_lines(
            stdout,
            job,
            self.threaded.output.clone(),
            self.marshal.clone(),
            ProcessEvent::Output,
        ));
        let err_task = tokio::spawn(read_lines(
            stderr,
            job,
            self.threaded.error.clone(),
            self.marshal.clone(),
            ProcessEvent::Error,
        ));

        let (exit_tx, exit_rx) = oneshot::channel();
        let pid = child.id();
        let exit_hooks = self.threaded.exit.clone();
        let marshal = self.marshal.clone();

        tokio::spawn(async move {
            let outcome = match child.wait().await {
                Ok(status) => ExitOutcome { code: status.code() },
                Err(e) => {
                    error!("Failed waiting for zip process: {}", e);
                    ExitOutcome { code: None }
                }
            };
            let _ = out_task.await;
            let _ = err_task.await;

            for hook in &exit_hooks {
                hook(outcome);
            }
            marshal.post(JobEvent {
                job,
                event: ProcessEvent::Exited(outcome),
            });
            let _ = exit_tx.send(outcome);
        });

        self.handle = Some(ProcessHandle {
            pid,
            exit: None,
            exit_rx: Some(exit_rx),
        });
        Ok(())
    }

    /// Like [`start`](Self::start), optionally holding the caller until the process exits.
    pub async fn start_with(&mut self, wait_for_exit: bool) -> Result<Option<ExitOutcome>> {
        self.start().await?;
        if wait_for_exit {
            Ok(self.wait_for_exit().await)
        } else {
            Ok(None)
        }
    }

    /// Waits for the process to end. Marshaled events still need to be pumped.
    pub async fn wait_for_exit(&mut self) -> Option<ExitOutcome> {
        let handle = self.handle.as_mut()?;
        if let Some(exit) = handle.exit {
            return Some(exit);
        }
        let rx = handle.exit_rx.take()?;
        rx.await.ok()
    }

    /// Runs the marshaled hooks for an event of this job. Called on the control loop.
    pub fn dispatch(&mut self, event: &ProcessEvent) {
        match event {
            ProcessEvent::Output(line) => {
                for hook in self.marshaled.output.iter_mut() {
                    hook(line);
                }
            }
            ProcessEvent::Error(line) => {
                for hook in self.marshaled.error.iter_mut() {
                    hook(line);
                }
            }
            ProcessEvent::Exited(outcome) => {
                if let Some(handle) = self.handle.as_mut() {
                    handle.exit = Some(*outcome);
                    handle.exit_rx = None;
                }
                for hook in self.marshaled.exit.iter_mut() {
                    hook(*outcome);
                }
            }
        }
    }
}

async fn read_lines<R>(
    reader: R,
    job: JobId,
    hooks: Vec<LineHook>,
    marshal: MarshalHandle<JobEvent>,
    wrap: fn(String) -> ProcessEvent,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end_matches(&['\r', '\n'][..]);
                if line.is_empty() {
                    continue;
                }
                for hook in &hooks {
                    hook(line);
                }
                marshal.post(JobEvent {
                    job,
                    event: wrap(line.to_string()),
                });
            }
            Err(e) => {
                warn!("Stopped reading zip process output: {}", e);
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::backup::marshal::EventMarshaler;
    use crate::backup::tool::test_support::{ScriptTool, StubTool};
    use crate::backup::{ToolKind, ToolOptions};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    fn job(dir: &TempDir, output: PathBuf) -> ArchiveJob {
        let src = dir.path().join("Assets");
        std::fs::create_dir_all(&src).unwrap();
        ArchiveJob::new(output, vec![src], ToolKind::SevenZip, ToolOptions::default())
    }

    fn script(body: &str) -> Arc<dyn ArchiveTool> {
        Arc::new(ScriptTool::new(ToolKind::SevenZip, body))
    }

    async fn run(process: &mut ZipProcess, marshaler: &EventMarshaler<JobEvent>) -> Vec<ProcessEvent> {
        let exit = tokio::time::timeout(Duration::from_secs(10), process.start_with(true))
            .await
            .unwrap()
            .unwrap();
        assert!(exit.is_some());

        let mut events = Vec::new();
        while !matches!(events.last(), Some(ProcessEvent::Exited(_))) {
            marshaler.pump(|e: JobEvent| {
                process.dispatch(&e.event);
                events.push(e.event);
            });
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        events
    }

    #[test]
    fn test_construction_preconditions() {
        let dir = TempDir::new().unwrap();
        let marshaler = EventMarshaler::new();
        let tool = script("exit 0");

        let empty_output = ArchiveJob::new("", vec![dir.path().to_path_buf()], ToolKind::SevenZip, ToolOptions::default());
        assert!(matches!(
            ZipProcess::new(tool.clone(), empty_output, marshaler.handle()),
            Err(ZipBackupError::InvalidOutputPath)
        ));

        let no_sources = ArchiveJob::new(dir.path().join("o.zip"), vec![], ToolKind::SevenZip, ToolOptions::default());
        assert!(matches!(
            ZipProcess::new(tool, no_sources, marshaler.handle()),
            Err(ZipBackupError::NoSources)
        ));

        let unsupported: Arc<dyn ArchiveTool> = Arc::new(StubTool::new(ToolKind::FastZip, false));
        let err = ZipProcess::new(unsupported, job(&dir, dir.path().join("o.zip")), marshaler.handle())
            .err()
            .unwrap();
        assert!(err.is_configuration());
        assert!(matches!(err, ZipBackupError::Unsupported { tool: ToolKind::FastZip }));
    }

    #[tokio::test]
    async fn test_start_creates_output_directory() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("deep").join("Backups").join("out.zip");
        let marshaler = EventMarshaler::new();
        let mut process = ZipProcess::new(script("exit 0"), job(&dir, output.clone()), marshaler.handle()).unwrap();

        process.start().await.unwrap();
        assert!(output.parent().unwrap().is_dir());
        assert!(process.is_started());
        process.wait_for_exit().await;
    }

    #[tokio::test]
    async fn test_start_removes_previous_archive() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("out.zip");
        std::fs::write(&output, b"stale").unwrap();
        let marshaler = EventMarshaler::new();
        let mut process = ZipProcess::new(
            script("if [ -e \"$1\" ]; then exit 3; fi; exit 0"),
            job(&dir, output.clone()),
            marshaler.handle(),
        )
        .unwrap();

        let events = run(&mut process, &marshaler).await;
        assert_eq!(events.last(), Some(&ProcessEvent::Exited(ExitOutcome { code: Some(0) })));
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn test_lines_are_marshaled_in_order_without_blanks() {
        let dir = TempDir::new().unwrap();
        let marshaler = EventMarshaler::new();
        let mut process = ZipProcess::new(
            script("echo one; echo; echo two; printf 'three\\r\\n'; echo oops >&2; exit 0"),
            job(&dir, dir.path().join("o.zip")),
            marshaler.handle(),
        )
        .unwrap();

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        process.on_output(move |line| sink.lock().push(line.to_string()));

        let events = run(&mut process, &marshaler).await;
        let outputs: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ProcessEvent::Output(l) => Some(l.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(outputs, vec!["one", "two", "three"]);
        assert!(events.contains(&ProcessEvent::Error("oops".to_string())));
        assert_eq!(*seen.lock(), vec!["one", "two", "three"]);
        assert_eq!(process.exit(), Some(ExitOutcome { code: Some(0) }));
    }

    #[tokio::test]
    async fn test_threaded_hooks_fire_before_pump() {
        let dir = TempDir::new().unwrap();
        let marshaler = EventMarshaler::new();
        let mut process = ZipProcess::new(
            script("echo a; echo b >&2; exit 0"),
            job(&dir, dir.path().join("o.zip")),
            marshaler.handle(),
        )
        .unwrap();

        let threaded = Arc::new(AtomicUsize::new(0));
        let marshaled = Arc::new(AtomicUsize::new(0));
        let (t1, t2, t3) = (threaded.clone(), threaded.clone(), threaded.clone());
        process
            .on_output_threaded(move |_| {
                t1.fetch_add(1, Ordering::SeqCst);
            })
            .on_error_threaded(move |_| {
                t2.fetch_add(1, Ordering::SeqCst);
            })
            .on_exit_threaded(move |_| {
                t3.fetch_add(1, Ordering::SeqCst);
            });
        let m = marshaled.clone();
        process.on_exit(move |_| {
            m.fetch_add(1, Ordering::SeqCst);
        });

        process.start_with(true).await.unwrap();
        assert_eq!(threaded.load(Ordering::SeqCst), 3);
        assert_eq!(marshaled.load(Ordering::SeqCst), 0);

        while marshaled.load(Ordering::SeqCst) == 0 {
            marshaler.pump(|e: JobEvent| process.dispatch(&e.event));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(marshaled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_nonzero_exit_code_is_reported() {
        let dir = TempDir::new().unwrap();
        let marshaler = EventMarshaler::new();
        let mut process = ZipProcess::new(script("exit 3"), job(&dir, dir.path().join("o.zip")), marshaler.handle()).unwrap();

        let events = run(&mut process, &marshaler).await;
        assert_eq!(events, vec![ProcessEvent::Exited(ExitOutcome { code: Some(3) })]);
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let dir = TempDir::new().unwrap();
        let marshaler = EventMarshaler::new();
        let mut process = ZipProcess::new(script("sleep 0.2"), job(&dir, dir.path().join("o.zip")), marshaler.handle()).unwrap();

        process.start().await.unwrap();
        let pid = process.pid();
        assert!(matches!(process.start().await, Err(ZipBackupError::AlreadyStarted)));
        assert_eq!(process.pid(), pid);
        process.wait_for_exit().await;
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let dir = TempDir::new().unwrap();
        let marshaler = EventMarshaler::new();
        let tool: Arc<dyn ArchiveTool> = Arc::new(StubTool {
            kind: ToolKind::SevenZip,
            executable: Some(dir.path().join("no-such-7z")),
            supported: true,
        });
        let mut process = ZipProcess::new(tool, job(&dir, dir.path().join("o.zip")), marshaler.handle()).unwrap();

        assert!(matches!(process.start().await, Err(ZipBackupError::Spawn { .. })));
        assert!(!process.is_started());
        assert_eq!(marshaler.pending(), 0);
    }
}
