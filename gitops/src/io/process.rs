//! Helpers for running child processes with timeouts and bounded output.

use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::error::ExecutionFailure;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub elapsed: Duration,
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
/// A child that outlives `timeout` is killed and reaped, and the call fails with
/// [`ExecutionFailure::TimedOut`].
#[instrument(
    skip_all,
    fields(label = %label, timeout_secs = timeout.as_secs(), output_limit_bytes)
)]
pub fn run_command_with_timeout(
    mut cmd: Command,
    label: &str,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput, ExecutionFailure> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!("spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(ExecutionFailure::Spawn {
                command: label.to_string(),
                source: e,
            });
        }
    };

    let wait_failure = |message: String| ExecutionFailure::Wait {
        command: label.to_string(),
        message,
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| wait_failure("stdout was not piped".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| wait_failure("stderr was not piped".to_string()))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let status = match child
        .wait_timeout(timeout)
        .map_err(|e| wait_failure(format!("wait: {e}")))?
    {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            child
                .kill()
                .map_err(|e| wait_failure(format!("kill after timeout: {e}")))?;
            child
                .wait()
                .map_err(|e| wait_failure(format!("wait after kill: {e}")))?;
            // Drain the readers so their threads exit; output is discarded.
            let _ = join_output(stdout_handle);
            let _ = join_output(stderr_handle);
            return Err(ExecutionFailure::TimedOut {
                command: label.to_string(),
                timeout,
            });
        }
    };
    let elapsed = started.elapsed();

    let (stdout, stdout_truncated) =
        join_output(stdout_handle).map_err(|e| wait_failure(format!("stdout: {e}")))?;
    let (stderr, stderr_truncated) =
        join_output(stderr_handle).map_err(|e| wait_failure(format!("stderr: {e}")))?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), elapsed_ms = elapsed.as_millis() as u64, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        elapsed,
    })
}

fn join_output(
    handle: thread::JoinHandle<std::io::Result<(Vec<u8>, usize)>>,
) -> Result<(Vec<u8>, usize), String> {
    match handle.join() {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(_) => Err("output reader thread panicked".to_string()),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> std::io::Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
