// ABOUTME: Local process isolation backend for hosts without a container runtime
// ABOUTME: Runs each artifact in a private temp dir and process group with a scrubbed environment

use super::{BackendError, CaptureBuffer, IsolationBackend, Resource, Result, SandboxHandle};
use crate::types::{ExecutionRequest, RawOutput, ResourceLimits, Termination};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long to wait for pipe readers after the child is gone
const READER_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Command used to run an artifact, e.g. `["python3"]` or `["sh"]`
    pub interpreter: Vec<String>,
    /// Per-stream byte ceiling for captured output
    pub capture_limit: usize,
    /// Apply the memory ceiling as an address-space rlimit
    pub enforce_memory_limit: bool,
    /// Parent directory for sandbox dirs; system temp dir when `None`
    pub root: Option<PathBuf>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            interpreter: vec!["python3".to_string()],
            capture_limit: 1024 * 1024,
            enforce_memory_limit: true,
            root: None,
        }
    }
}

/// Weaker isolation than containers: no network or filesystem namespace,
/// but a throwaway working directory, cleared environment, memory rlimit and
/// whole-group kill on timeout.
pub struct ProcessBackend {
    config: ProcessConfig,
}

type SharedCapture = Arc<Mutex<CaptureBuffer>>;

impl ProcessBackend {
    pub fn new(config: ProcessConfig) -> Result<Self> {
        if config.interpreter.is_empty() {
            return Err(BackendError::Unavailable(
                "no interpreter configured".to_string(),
            ));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    fn command(&self, dir: &std::path::Path, request: &ExecutionRequest) -> Command {
        let mut cmd = Command::new(&self.config.interpreter[0]);
        cmd.args(&self.config.interpreter[1..])
            .arg(&request.artifact.name)
            .args(&request.args)
            .current_dir(dir)
            .env_clear()
            .env("HOME", dir)
            .env("TMPDIR", dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(path) = std::env::var_os("PATH") {
            cmd.env("PATH", path);
        }

        #[cfg(unix)]
        {
            cmd.process_group(0);
            if self.config.enforce_memory_limit {
                apply_memory_limit(&mut cmd, &request.limits);
            }
        }

        cmd
    }
}

#[cfg(unix)]
fn apply_memory_limit(cmd: &mut Command, limits: &ResourceLimits) {
    use nix::sys::resource::{setrlimit, Resource};

    let limit = limits.memory_limit_bytes as nix::libc::rlim_t;
    // SAFETY: setrlimit is async-signal-safe and touches no parent state
    unsafe {
        cmd.pre_exec(move || {
            setrlimit(Resource::RLIMIT_AS, limit, limit).map_err(std::io::Error::from)
        });
    }
}

/// SIGKILL every process in the group led by `pid`
#[cfg(unix)]
fn kill_group(pid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!("Failed to kill process group {}: {}", pid, e),
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// Drain `stream` into `capture`, reading past the ceiling so the writer never blocks
fn spawn_reader<R>(mut stream: R, capture: SharedCapture) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => capture
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(&chunk[..n]),
                Err(e) => {
                    debug!("Output reader stopped: {}", e);
                    break;
                }
            }
        }
    })
}

fn take_capture(capture: &SharedCapture) -> (Vec<u8>, bool) {
    let mut guard = capture.lock().unwrap_or_else(|e| e.into_inner());
    std::mem::replace(&mut *guard, CaptureBuffer::new(0)).into_parts()
}

#[async_trait]
impl IsolationBackend for ProcessBackend {
    async fn acquire(&self, _limits: &ResourceLimits) -> Result<SandboxHandle> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("knapsack-");
        let dir = match &self.config.root {
            Some(root) => {
                tokio::fs::create_dir_all(root).await?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };

        let id = format!("process-{}", uuid::Uuid::new_v4());
        debug!("Created sandbox directory {}", dir.path().display());
        Ok(SandboxHandle::directory(id, dir))
    }

    async fn execute(
        &self,
        handle: &SandboxHandle,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<RawOutput> {
        let Resource::Directory(dir) = &handle.resource else {
            return Err(BackendError::Execution(format!(
                "handle {} does not belong to the process backend",
                handle.id()
            )));
        };

        tokio::fs::write(dir.path().join(&request.artifact.name), &request.artifact.source)
            .await?;

        let started = Instant::now();
        let mut child = self.command(dir.path(), request).spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BackendError::Unavailable(format!(
                    "interpreter {:?} not found",
                    self.config.interpreter[0]
                ))
            } else {
                BackendError::Io(e)
            }
        })?;
        let pid = child.id();

        let stdout_capture = Arc::new(Mutex::new(CaptureBuffer::new(self.config.capture_limit)));
        let stderr_capture = Arc::new(Mutex::new(CaptureBuffer::new(self.config.capture_limit)));
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, stdout_capture.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, stderr_capture.clone()));
        }

        let (termination, status) = tokio::select! {
            status = child.wait() => (Termination::Exited, Some(status?)),
            _ = tokio::time::sleep(request.timeout) => (Termination::TimedOut, None),
            _ = cancel.cancelled() => (Termination::Cancelled, None),
        };
        let duration = started.elapsed();

        // Children the program left behind die with the group either way
        if let Some(pid) = pid {
            kill_group(pid);
        }
        if status.is_none() {
            info!(
                "Killed sandbox {} ({:?} after {:?})",
                handle.id(),
                termination,
                duration
            );
            if let Err(e) = child.start_kill() {
                debug!("start_kill after group kill: {}", e);
            }
            if let Err(e) = child.wait().await {
                warn!("Failed to reap sandbox process: {}", e);
            }
        }

        for reader in readers {
            let abort = reader.abort_handle();
            if tokio::time::timeout(READER_GRACE, reader).await.is_err() {
                warn!("Output reader for sandbox {} did not finish", handle.id());
                abort.abort();
            }
        }

        let (stdout, stdout_overflowed) = take_capture(&stdout_capture);
        let (stderr, stderr_overflowed) = take_capture(&stderr_capture);

        Ok(RawOutput {
            exit_code: status.and_then(|s| s.code()).map(i64::from),
            signal: status.as_ref().and_then(exit_signal),
            stdout,
            stderr,
            stdout_overflowed,
            stderr_overflowed,
            duration,
            termination,
        })
    }

    async fn release(&self, handle: SandboxHandle) -> Result<()> {
        let id = handle.id().to_string();
        match handle.resource {
            Resource::Directory(dir) => {
                tokio::task::spawn_blocking(move || dir.close())
                    .await
                    .map_err(|e| BackendError::Execution(e.to_string()))??;
                debug!("Removed sandbox directory for {}", id);
                Ok(())
            }
            _ => Err(BackendError::Execution(format!(
                "handle {} does not belong to the process backend",
                id
            ))),
        }
    }

    fn name(&self) -> &'static str {
        "process"
    }
}
