//! Shared subprocess management.
//!
//! [`run_command`] holds the spawn + I/O + timeout handling used by every
//! delivery mode. Callers build the [`tokio::process::Command`] (program,
//! arguments, environment) and optionally pass bytes to stream over stdin.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use super::executor::{ExecutionResult, ScriptError};

/// Maximum stdout or stderr size captured per stream (10 MiB).
///
/// Output exceeding this limit is truncated to prevent memory exhaustion
/// from extremely verbose scripts.
const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Spawn `cmd`, stream `stdin_payload` (if any) to it, capture
/// stdout/stderr, and enforce `timeout`.
pub async fn run_command(
    cmd: &mut Command,
    stdin_payload: Option<Vec<u8>>,
    timeout: Duration,
) -> Result<ExecutionResult, ScriptError> {
    // `kill_on_drop(true)` ensures the child is killed if this future is
    // dropped (e.g. the step around it is aborted).
    cmd.stdin(if stdin_payload.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

    let start = Instant::now();

    let mut child = cmd.spawn()?;

    // Read stdout/stderr in spawned tasks so we can still call `child.wait()`
    // (which borrows `&mut child`) and so a chatty child never blocks on a
    // full pipe while we are still writing its stdin.
    let stdout_handle = child.stdout.take();
    let stderr_handle = child.stderr.take();
    let stdout_task = tokio::spawn(async move { read_stream(stdout_handle).await });
    let stderr_task = tokio::spawn(async move { read_stream(stderr_handle).await });

    if let (Some(mut stdin), Some(payload)) = (child.stdin.take(), stdin_payload) {
        tokio::spawn(async move {
            // If the shell exits early it closes stdin; that surfaces through
            // the exit code, not here.
            let _ = stdin.write_all(&payload).await;
            let _ = stdin.shutdown().await;
        });
    }

    let wait_result = tokio::time::timeout(timeout, child.wait()).await;

    match wait_result {
        Ok(Ok(status)) => {
            let duration_ms = start.elapsed().as_millis() as u64;
            let stdout_bytes = stdout_task.await.unwrap_or_default();
            let stderr_bytes = stderr_task.await.unwrap_or_default();
            Ok(ExecutionResult::new(
                String::from_utf8_lossy(&stdout_bytes).into_owned(),
                String::from_utf8_lossy(&stderr_bytes).into_owned(),
                status.code().unwrap_or(-1),
                duration_ms,
            ))
        }
        Ok(Err(e)) => Err(ScriptError::IoError(e)),
        Err(_elapsed) => {
            let elapsed_ms = start.elapsed().as_millis() as u64;
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "Failed to kill timed-out script");
            }
            stdout_task.abort();
            stderr_task.abort();
            Err(ScriptError::Timeout { elapsed_ms })
        }
    }
}

/// Read an entire output stream into a byte buffer, capped at [`MAX_OUTPUT_BYTES`].
async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut h) = handle {
        let _ = (&mut h)
            .take(MAX_OUTPUT_BYTES as u64)
            .read_to_end(&mut buf)
            .await;
    }
    buf
}
