//! Error taxonomy shared by every operation.
//!
//! Operator-correctable problems (bad input, busy instance, unknown slug)
//! map to exit code 2; infrastructure failures map to exit code 1. A
//! `PartialFailure` reports the failed step together with what the rollback
//! managed to undo, so one message tells the operator where things stand.

use thiserror::Error;

pub type FleetResult<T> = Result<T, FleetError>;

#[derive(Debug, Error)]
pub enum FleetError {
    /// Invalid operator input, reported before anything was touched.
    #[error("{0}")]
    Validation(String),

    /// The requested resource already exists or is busy.
    #[error("{0}")]
    Conflict(String),

    #[error("instance '{0}' not found")]
    NotFound(String),

    /// A bounded wait expired. The waited-for condition may still complete
    /// in the background; the message says what was being waited for.
    #[error("timed out after {seconds}s waiting for {waiting_for}")]
    Timeout { waiting_for: String, seconds: u64 },

    /// A multi-step operation failed partway and compensating rollback ran.
    #[error(
        "{operation} failed at step '{failed_step}': {cause}{}",
        format_rollback(.rolled_back, .rollback_failures)
    )]
    PartialFailure {
        operation: String,
        failed_step: String,
        cause: String,
        /// Compensations that succeeded, in execution order.
        rolled_back: Vec<String>,
        /// Compensations that themselves failed; these name resources that
        /// need manual cleanup.
        rollback_failures: Vec<String>,
    },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl FleetError {
    /// Process exit code: 2 for operator-correctable errors, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Validation(_) | Self::Conflict(_) | Self::NotFound(_) => 2,
            Self::Timeout { .. } | Self::PartialFailure { .. } | Self::Internal(_) => 1,
        }
    }

    /// Stable machine-readable category name.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Conflict(_) => "conflict",
            Self::NotFound(_) => "not_found",
            Self::Timeout { .. } => "timeout",
            Self::PartialFailure { .. } => "partial_failure",
            Self::Internal(_) => "internal",
        }
    }
}

fn format_rollback(rolled_back: &[String], failures: &[String]) -> String {
    let mut out = String::new();
    if !rolled_back.is_empty() {
        out.push_str(&format!("; rolled back: {}", rolled_back.join(", ")));
    }
    if !failures.is_empty() {
        out.push_str(&format!(
            "; rollback failures (manual cleanup needed): {}",
            failures.join(", ")
        ));
    }
    out
}

/// Outcome of an operation that succeeded overall but may have degraded
/// steps the operator should know about.
#[derive(Debug, Default)]
pub struct OpReport {
    pub warnings: Vec<String>,
}

impl OpReport {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn merge(&mut self, other: OpReport) {
        self.warnings.extend(other.warnings);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes() {
        assert_eq!(FleetError::Validation("bad".into()).exit_code(), 2);
        assert_eq!(FleetError::Conflict("busy".into()).exit_code(), 2);
        assert_eq!(FleetError::NotFound("ghost".into()).exit_code(), 2);
        assert_eq!(
            FleetError::Timeout {
                waiting_for: "x".into(),
                seconds: 5
            }
            .exit_code(),
            1
        );
        assert_eq!(
            FleetError::Internal(anyhow::anyhow!("boom")).exit_code(),
            1
        );
    }

    #[test]
    fn partial_failure_message_includes_rollback_outcome() {
        let err = FleetError::PartialFailure {
            operation: "create".into(),
            failed_step: "start process".into(),
            cause: "spawn failed".into(),
            rolled_back: vec!["dropped database 'bot_alpha'".into()],
            rollback_failures: vec!["remove /srv/alpha: permission denied".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("create failed at step 'start process'"));
        assert!(msg.contains("rolled back: dropped database 'bot_alpha'"));
        assert!(msg.contains("manual cleanup needed"));
        assert_eq!(err.exit_code(), 1);
        assert_eq!(err.error_code(), "partial_failure");
    }

    #[test]
    fn clean_partial_failure_has_no_rollback_suffix() {
        let err = FleetError::PartialFailure {
            operation: "create".into(),
            failed_step: "materialize config".into(),
            cause: "disk full".into(),
            rolled_back: vec![],
            rollback_failures: vec![],
        };
        assert!(!err.to_string().contains("rolled back"));
    }

    #[test]
    fn report_merge_accumulates_warnings() {
        let mut a = OpReport::ok();
        a.warn("first");
        let mut b = OpReport::ok();
        b.warn("second");
        a.merge(b);
        assert_eq!(a.warnings, vec!["first", "second"]);
    }
}
