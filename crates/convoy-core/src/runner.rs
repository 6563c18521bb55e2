//! Spawns and supervises one external tool process.
//!
//! Output streaming, termination classification, and the graceful-then-
//! forceful stop escalation all live here; callers only see text chunks and
//! a [`RunResult`].

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::parser::{is_progress_line, LineBuffer};

/// Grace period between the graceful stop signal and the forceful kill.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(1);

/// Synthetic exit code reported when the executable cannot be spawned.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

/// Classified termination of one tool process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub exit_code: i32,
    pub saw_output: bool,
    /// Most recent non-empty output line that does not look like a progress
    /// line; the best diagnostic available when no structured stats exist.
    pub last_diagnostic: Option<String>,
    /// Termination was caused by a delivered signal rather than normal exit.
    pub cancelled: bool,
}

struct HandleState {
    pid: u32,
    exited: AtomicBool,
    terminate_requested: AtomicBool,
}

/// Cancel handle for a running process. Cloneable; the underlying process is
/// owned by [`run`] and never exposed.
#[derive(Clone)]
pub struct ProcessHandle {
    state: Arc<HandleState>,
}

impl ProcessHandle {
    /// Request termination: graceful stop signal now, forceful kill after
    /// [`TERMINATE_GRACE`] if the process is still alive. The two-step
    /// escalation is mandatory: the tool may ignore the graceful signal
    /// mid-write. Idempotent; an exited process is never signalled again.
    pub fn terminate(&self) {
        if self.state.terminate_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.state.exited.load(Ordering::SeqCst) {
            return;
        }
        signal_graceful(self.state.pid);

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            tokio::time::sleep(TERMINATE_GRACE).await;
            if !state.exited.load(Ordering::SeqCst) {
                signal_forceful(state.pid);
            }
        });
    }

    pub fn termination_requested(&self) -> bool {
        self.state.terminate_requested.load(Ordering::SeqCst)
    }
}

#[cfg(unix)]
fn signal_graceful(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(unix)]
fn signal_forceful(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn signal_graceful(_pid: u32) {}

#[cfg(not(unix))]
fn signal_forceful(_pid: u32) {}

#[cfg(unix)]
fn classify_status(status: &ExitStatus) -> (i32, bool) {
    use std::os::unix::process::ExitStatusExt;
    if let Some(signal) = status.signal() {
        (128 + signal, true)
    } else {
        (status.code().unwrap_or(-1), false)
    }
}

#[cfg(not(unix))]
fn classify_status(status: &ExitStatus) -> (i32, bool) {
    (status.code().unwrap_or(-1), false)
}

fn note_chunk<C: FnMut(&str)>(
    bytes: &[u8],
    saw: &mut bool,
    diag: &mut Option<String>,
    lines: &mut LineBuffer,
    sink: &mut C,
) {
    let text = String::from_utf8_lossy(bytes);
    *saw = true;
    for line in lines.push(&text) {
        let trimmed = line.trim();
        if !trimmed.is_empty() && !is_progress_line(trimmed) {
            *diag = Some(trimmed.to_string());
        }
    }
    sink(&text);
}

/// Spawn `executable` with `args`, stream its combined stdout/stderr through
/// `on_chunk`, and block until it terminates.
///
/// `on_start` fires once with the cancel handle after a successful spawn,
/// before any output is awaited, so callers can register it for
/// cancellation. Chunk boundaries split lines arbitrarily; callers buffer.
///
/// Spawn failure never propagates as an error: the reason is injected
/// through `on_chunk` as if the tool had printed it, and the result carries
/// [`SPAWN_FAILURE_EXIT_CODE`].
pub async fn run<F, C>(executable: &Path, args: &[String], on_start: F, mut on_chunk: C) -> RunResult
where
    F: FnOnce(ProcessHandle),
    C: FnMut(&str),
{
    let mut child = match Command::new(executable)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            let reason = format!("failed to launch {}: {err}", executable.display());
            on_chunk(&format!("{reason}\n"));
            return RunResult {
                exit_code: SPAWN_FAILURE_EXIT_CODE,
                saw_output: true,
                last_diagnostic: Some(reason),
                cancelled: false,
            };
        }
    };

    let state = Arc::new(HandleState {
        pid: child.id().unwrap_or(0),
        exited: AtomicBool::new(false),
        terminate_requested: AtomicBool::new(false),
    });
    on_start(ProcessHandle {
        state: Arc::clone(&state),
    });

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut out_buf = [0u8; 8192];
    let mut err_buf = [0u8; 8192];

    let mut saw_output = false;
    let mut last_diagnostic: Option<String> = None;
    let mut diag_lines = LineBuffer::default();

    while stdout.is_some() || stderr.is_some() {
        tokio::select! {
            read = async {
                match stdout.as_mut() {
                    Some(pipe) => pipe.read(&mut out_buf).await,
                    None => Ok(0),
                }
            }, if stdout.is_some() => {
                match read {
                    Ok(0) | Err(_) => stdout = None,
                    Ok(n) => note_chunk(&out_buf[..n], &mut saw_output, &mut last_diagnostic, &mut diag_lines, &mut on_chunk),
                }
            }
            read = async {
                match stderr.as_mut() {
                    Some(pipe) => pipe.read(&mut err_buf).await,
                    None => Ok(0),
                }
            }, if stderr.is_some() => {
                match read {
                    Ok(0) | Err(_) => stderr = None,
                    Ok(n) => note_chunk(&err_buf[..n], &mut saw_output, &mut last_diagnostic, &mut diag_lines, &mut on_chunk),
                }
            }
        }
    }

    // Both pipes hit EOF; drain the unterminated tail before classifying.
    if let Some(tail) = diag_lines.finish() {
        let trimmed = tail.trim();
        if !trimmed.is_empty() && !is_progress_line(trimmed) {
            last_diagnostic = Some(trimmed.to_string());
        }
    }

    let status = child.wait().await;
    state.exited.store(true, Ordering::SeqCst);

    let (exit_code, signalled) = match status {
        Ok(status) => classify_status(&status),
        Err(err) => {
            let reason = format!("failed to reap {}: {err}", executable.display());
            on_chunk(&format!("{reason}\n"));
            last_diagnostic = Some(reason);
            (-1, false)
        }
    };

    RunResult {
        exit_code,
        saw_output,
        last_diagnostic,
        cancelled: signalled || state.terminate_requested.load(Ordering::SeqCst),
    }
}
