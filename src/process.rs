//! Process supervisor adapter: a thin pass-through to pm2's named-process
//! API. `stop` and `remove` are idempotent, and `status` degrades to
//! `Unknown` (not an error) when pm2 itself cannot be reached so listings
//! can still render a partial view.

use crate::error::{FleetError, FleetResult};
use crate::instance::ProcessStatus;
use crate::utils::run_with_timeout;
use anyhow::anyhow;
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Register and start the process described by `descriptor`.
    async fn start(&self, name: &str, descriptor: &Path) -> FleetResult<()>;

    /// Stop the named process. Stopping an already-stopped or absent
    /// process is success, not error.
    async fn stop(&self, name: &str) -> FleetResult<()>;

    /// Restart the named process (must be known to the supervisor).
    async fn restart(&self, name: &str) -> FleetResult<()>;

    async fn status(&self, name: &str) -> ProcessStatus;

    /// Remove the process from the supervisor entirely. Idempotent.
    async fn remove(&self, name: &str) -> FleetResult<()>;
}

/// Adapter over the `pm2` CLI.
pub struct Pm2Supervisor {
    pm2_bin: String,
    timeout: Duration,
}

impl Default for Pm2Supervisor {
    fn default() -> Self {
        Self {
            pm2_bin: "pm2".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

impl Pm2Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn build_command(&self) -> Command {
        let mut cmd = Command::new(&self.pm2_bin);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    /// pm2 reports unknown process names on stderr; those are the
    /// idempotent no-op cases for stop/delete.
    fn is_not_found(stderr: &str) -> bool {
        let lower = stderr.to_lowercase();
        lower.contains("not found") || lower.contains("doesn't exist")
    }
}

/// Map a pm2 `jlist` status string onto the adapter's status enum.
fn map_pm2_status(status: &str) -> ProcessStatus {
    match status {
        "online" | "launching" => ProcessStatus::Running,
        _ => ProcessStatus::Stopped,
    }
}

#[async_trait]
impl ProcessSupervisor for Pm2Supervisor {
    async fn start(&self, name: &str, descriptor: &Path) -> FleetResult<()> {
        let mut cmd = self.build_command();
        cmd.arg("start").arg(descriptor);
        let out = run_with_timeout(cmd, None, self.timeout, "pm2 start").await?;
        if !out.success {
            return Err(FleetError::Internal(anyhow!(
                "pm2 start of '{}' failed: {}",
                name,
                out.stderr.trim()
            )));
        }
        tracing::info!("Started process '{}'", name);
        Ok(())
    }

    async fn stop(&self, name: &str) -> FleetResult<()> {
        let mut cmd = self.build_command();
        cmd.arg("stop").arg(name);
        let out = run_with_timeout(cmd, None, self.timeout, "pm2 stop").await?;
        if !out.success && !Self::is_not_found(&out.stderr) {
            return Err(FleetError::Internal(anyhow!(
                "pm2 stop of '{}' failed: {}",
                name,
                out.stderr.trim()
            )));
        }
        tracing::info!("Stopped process '{}'", name);
        Ok(())
    }

    async fn restart(&self, name: &str) -> FleetResult<()> {
        let mut cmd = self.build_command();
        cmd.arg("restart").arg(name);
        let out = run_with_timeout(cmd, None, self.timeout, "pm2 restart").await?;
        if !out.success {
            return Err(FleetError::Internal(anyhow!(
                "pm2 restart of '{}' failed: {}",
                name,
                out.stderr.trim()
            )));
        }
        tracing::info!("Restarted process '{}'", name);
        Ok(())
    }

    async fn status(&self, name: &str) -> ProcessStatus {
        let mut cmd = self.build_command();
        cmd.arg("jlist");
        let out = match run_with_timeout(cmd, None, self.timeout, "pm2 jlist").await {
            Ok(out) if out.success => out,
            _ => {
                tracing::warn!("pm2 unreachable while querying status of '{}'", name);
                return ProcessStatus::Unknown;
            }
        };

        let list: Vec<serde_json::Value> = match serde_json::from_str(&out.stdout_text()) {
            Ok(list) => list,
            Err(e) => {
                tracing::warn!("Unparsable pm2 jlist output: {}", e);
                return ProcessStatus::Unknown;
            }
        };

        for proc in &list {
            if proc.get("name").and_then(|n| n.as_str()) == Some(name) {
                let status = proc
                    .pointer("/pm2_env/status")
                    .and_then(|s| s.as_str())
                    .unwrap_or("unknown");
                return map_pm2_status(status);
            }
        }
        ProcessStatus::Absent
    }

    async fn remove(&self, name: &str) -> FleetResult<()> {
        let mut cmd = self.build_command();
        cmd.arg("delete").arg(name);
        let out = run_with_timeout(cmd, None, self.timeout, "pm2 delete").await?;
        if !out.success && !Self::is_not_found(&out.stderr) {
            return Err(FleetError::Internal(anyhow!(
                "pm2 delete of '{}' failed: {}",
                name,
                out.stderr.trim()
            )));
        }
        tracing::info!("Removed process '{}'", name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(map_pm2_status("online"), ProcessStatus::Running);
        assert_eq!(map_pm2_status("launching"), ProcessStatus::Running);
        assert_eq!(map_pm2_status("stopped"), ProcessStatus::Stopped);
        assert_eq!(map_pm2_status("errored"), ProcessStatus::Stopped);
    }

    #[test]
    fn not_found_detection() {
        assert!(Pm2Supervisor::is_not_found("[PM2][ERROR] Process bot-x not found"));
        assert!(Pm2Supervisor::is_not_found("process or namespace doesn't exist"));
        assert!(!Pm2Supervisor::is_not_found("EACCES: permission denied"));
    }
}
