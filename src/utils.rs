//! Shared helpers for running external tools.

use crate::error::{FleetError, FleetResult};
use anyhow::anyhow;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Captured output of a finished external command.
pub struct CmdOutput {
    pub success: bool,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl CmdOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }
}

/// Spawn a command, optionally feed stdin, and wait with a bounded timeout.
/// On expiry the child is killed and a `Timeout` error is returned so the
/// operator is never left in an ambiguous waiting state.
///
/// The stdout/stderr drain tasks run before and during the stdin feed, and
/// the timeout covers the feed as well as the wait: a child that stops
/// reading stdin (or fills its output pipes) cannot stall the caller past
/// the bound.
pub async fn run_with_timeout(
    mut cmd: Command,
    stdin_bytes: Option<&[u8]>,
    timeout: Duration,
    what: &str,
) -> FleetResult<CmdOutput> {
    let mut child = cmd
        .spawn()
        .map_err(|e| FleetError::Internal(anyhow!("failed to spawn {}: {}", what, e)))?;

    let stdin = child.stdin.take();
    let stdout_pipe = child.stdout.take();
    let stdout_handle = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = stdout_pipe {
            let _ = tokio::io::AsyncReadExt::read_to_end(&mut pipe, &mut buf).await;
        }
        buf
    });
    let stderr_pipe = child.stderr.take();
    let stderr_handle = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = stderr_pipe {
            let _ = tokio::io::AsyncReadExt::read_to_end(&mut pipe, &mut buf).await;
        }
        String::from_utf8_lossy(&buf).to_string()
    });

    let interaction = async {
        // The unmatched arm drops the pipe, closing stdin before the wait.
        if let (Some(bytes), Some(mut pipe)) = (stdin_bytes, stdin) {
            pipe.write_all(bytes)
                .await
                .map_err(|e| FleetError::Internal(anyhow!("failed to feed {}: {}", what, e)))?;
            pipe.shutdown().await.map_err(|e| {
                FleetError::Internal(anyhow!("failed to close {} stdin: {}", what, e))
            })?;
            drop(pipe);
        }
        child
            .wait()
            .await
            .map_err(|e| FleetError::Internal(anyhow!("{} process error: {}", what, e)))
    };

    match tokio::time::timeout(timeout, interaction).await {
        Ok(Ok(status)) => {
            let stdout = stdout_handle.await.unwrap_or_default();
            let stderr = stderr_handle.await.unwrap_or_default();
            Ok(CmdOutput {
                success: status.success(),
                stdout,
                stderr,
            })
        }
        Ok(Err(e)) => Err(e),
        Err(_) => {
            let _ = child.kill().await;
            tracing::warn!("{} timed out after {}s -- killed", what, timeout.as_secs());
            Err(FleetError::Timeout {
                waiting_for: what.to_string(),
                seconds: timeout.as_secs(),
            })
        }
    }
}

/// Recursively copy a directory tree. Used to populate an instance directory
/// from the bot template and to refresh code on update.
pub fn copy_dir_recursive(src: &std::path::Path, dst: &std::path::Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
