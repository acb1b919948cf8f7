//! Backend process lifecycle.
//!
//! Spawns stdio backends, wires their pipes into a `StdioBridge`, keeps a
//! short tail of their stderr for diagnostics, and terminates them with a
//! bounded grace period.

use std::collections::{HashMap, VecDeque};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;

use super::errors::RouterError;
use super::transport::StdioBridge;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Stderr lines kept per process for error reports.
const STDERR_TAIL_LINES: usize = 20;

/// Truncation limit for a single captured stderr line.
const STDERR_LINE_MAX: usize = 500;

// ─── ManagedProcess ──────────────────────────────────────────────────────────

/// A running backend process with its bridge.
pub struct ManagedProcess {
    name: String,
    pid: Option<u32>,
    child: tokio::sync::Mutex<Child>,
    bridge: Arc<StdioBridge>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    stderr_task: Option<JoinHandle<()>>,
}

impl ManagedProcess {
    /// OS process id, if the platform reported one.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The process's JSON-RPC bridge.
    pub fn bridge(&self) -> Arc<StdioBridge> {
        Arc::clone(&self.bridge)
    }

    /// Check if the process is still running.
    ///
    /// A process that is being shut down right now counts as alive; the
    /// shutdown path owns its fate.
    pub fn is_alive(&self) -> bool {
        let Ok(mut child) = self.child.try_lock() else {
            return true;
        };
        matches!(child.try_wait(), Ok(None))
    }

    /// The last few stderr lines, joined.
    pub fn stderr_tail(&self) -> String {
        let tail = self
            .stderr_tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// Terminate the process: terminate signal, bounded wait, then force-kill.
    ///
    /// Always tears the bridge down, so every in-flight call resolves.
    pub async fn shutdown(&self, grace: Duration) -> Option<ExitStatus> {
        let mut child = self.child.lock().await;

        let status = match child.try_wait() {
            Ok(Some(status)) => Some(status),
            _ => {
                send_terminate(&self.name, &mut child);
                match tokio::time::timeout(grace, child.wait()).await {
                    Ok(Ok(status)) => Some(status),
                    _ => {
                        tracing::warn!(
                            server = %self.name,
                            grace_ms = grace.as_millis() as u64,
                            "process ignored terminate signal, killing"
                        );
                        let _ = child.kill().await;
                        child.try_wait().ok().flatten()
                    }
                }
            }
        };

        self.bridge.terminate();
        tracing::info!(server = %self.name, ?status, "process stopped");
        status
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}

/// Ask the process to exit.
#[cfg(unix)]
fn send_terminate(name: &str, child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::warn!(server = name, error = %e, "failed to send SIGTERM");
            }
        }
        None => {
            let _ = child.start_kill();
        }
    }
}

/// Ask the process to exit. No portable soft signal exists here.
#[cfg(not(unix))]
fn send_terminate(_name: &str, child: &mut Child) {
    let _ = child.start_kill();
}

// ─── Spawning ────────────────────────────────────────────────────────────────

/// What to launch.
pub struct SpawnRequest<'a> {
    pub command: &'a str,
    pub args: &'a [String],
    pub env: &'a HashMap<String, String>,
    pub cwd: Option<&'a str>,
    pub call_timeout: Duration,
}

/// Spawn a stdio backend and attach a bridge to its pipes.
pub fn spawn_process(name: &str, request: SpawnRequest<'_>) -> Result<ManagedProcess, RouterError> {
    let mut cmd = Command::new(request.command);
    cmd.args(request.args);
    cmd.envs(request.env);

    if let Some(dir) = request.cwd {
        cmd.current_dir(dir);
    }

    // Windows: prevent console window from appearing for child processes
    #[cfg(target_os = "windows")]
    {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| RouterError::StartFailed {
        name: name.to_string(),
        reason: format!("{}: {e}", request.command),
    })?;

    let stdin = child.stdin.take().ok_or(RouterError::StartFailed {
        name: name.to_string(),
        reason: "failed to capture stdin".into(),
    })?;
    let stdout = child.stdout.take().ok_or(RouterError::StartFailed {
        name: name.to_string(),
        reason: "failed to capture stdout".into(),
    })?;

    let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
    let stderr_task = child
        .stderr
        .take()
        .map(|stderr| tokio::spawn(drain_stderr(name.to_string(), stderr, Arc::clone(&stderr_tail))));

    let pid = child.id();
    let bridge = Arc::new(StdioBridge::new(name, stdin, stdout, request.call_timeout));

    tracing::info!(server = name, pid, command = request.command, "spawned backend process");

    Ok(ManagedProcess {
        name: name.to_string(),
        pid,
        child: tokio::sync::Mutex::new(child),
        bridge,
        stderr_tail,
        stderr_task,
    })
}

/// Forward backend stderr into the log and keep the most recent lines.
async fn drain_stderr(name: String, stderr: ChildStderr, tail: Arc<Mutex<VecDeque<String>>>) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(server = %name, error = %e, "stopped reading backend stderr");
                break;
            }
        }
        // Stderr is diagnostics only; invalid UTF-8 is replaced, never fatal.
        let mut line = String::from_utf8_lossy(&buf)
            .trim_end_matches(['\n', '\r'])
            .to_string();
        if line.len() > STDERR_LINE_MAX {
            let mut cut = STDERR_LINE_MAX;
            while !line.is_char_boundary(cut) {
                cut -= 1;
            }
            line.truncate(cut);
            line.push_str("...(truncated)");
        }
        tracing::debug!(server = %name, stderr = %line, "backend stderr");

        let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

/// Format a stderr suffix for error messages (empty string if no stderr).
pub fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.trim().is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
