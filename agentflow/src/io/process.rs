//! Helpers for running child processes with timeouts and bounded output.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, error, instrument, warn};

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: Option<ExitStatus>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.is_some_and(|status| status.success())
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn stderr_truncated_notice(&self, label: &str) -> String {
        if self.stderr_truncated > 0 {
            format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            )
        } else {
            String::new()
        }
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Stdin is written and both pipes are drained concurrently while the child runs.
/// `output_limit_bytes` bounds what is kept in memory; the rest is discarded while
/// the pipe is still drained. On timeout the child is killed and `status` is `None`.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub async fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdin_pipe = match stdin {
        Some(_) => Some(
            child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?,
        ),
        None => None,
    };
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let write_stdin = async move {
        if let (Some(mut pipe), Some(input)) = (stdin_pipe, stdin) {
            // A child that exits without reading stdin closes the pipe early.
            if let Err(e) = pipe.write_all(input).await {
                debug!(err = %e, "child closed stdin early");
            }
            drop(pipe);
        }
    };

    let drive = async {
        let ((), stdout, stderr, status) = tokio::join!(
            write_stdin,
            read_stream_limited(stdout, output_limit_bytes),
            read_stream_limited(stderr, output_limit_bytes),
            child.wait(),
        );
        Ok::<_, anyhow::Error>((stdout?, stderr?, status.context("wait for command")?))
    };

    let outcome = tokio::time::timeout(timeout, drive).await;
    let output = match outcome {
        Ok(result) => {
            let ((stdout, stdout_truncated), (stderr, stderr_truncated), status) = result?;
            CommandOutput {
                status: Some(status),
                stdout,
                stderr,
                stdout_truncated,
                stderr_truncated,
                timed_out: false,
            }
        }
        Err(_) => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            child.kill().await.context("kill command")?;
            CommandOutput {
                status: None,
                stdout: Vec::new(),
                stderr: Vec::new(),
                stdout_truncated: 0,
                stderr_truncated: 0,
                timed_out: true,
            }
        }
    };

    if output.stdout_truncated > 0 || output.stderr_truncated > 0 {
        warn!(
            stdout_truncated = output.stdout_truncated,
            stderr_truncated = output.stderr_truncated,
            "output truncated"
        );
    }
    debug!(
        exit_code = ?output.status.and_then(|s| s.code()),
        timed_out = output.timed_out,
        "command finished"
    );
    Ok(output)
}

async fn read_stream_limited<R: AsyncRead + Unpin>(
    mut reader: R,
    limit: usize,
) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).await.context("read output")?;
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
