//! Instance model: the unit of management.
//!
//! An instance is a directory under the instances root, a dedicated database
//! and role, and a supervised process. All of its resource names derive
//! deterministically from the slug and never diverge from it.

pub mod envfile;

use crate::config::GlobalConfig;
use crate::error::{FleetError, FleetResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment file name inside an instance directory.
pub const ENV_FILE: &str = "instance.env";
/// Process descriptor file name inside an instance directory.
pub const DESCRIPTOR_FILE: &str = "process.json";

/// A secret value that never appears in logs or debug output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(pub String);

impl Secret {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(****)")
    }
}

/// Live process status as reported by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Running,
    Stopped,
    Absent,
    /// The supervisor itself could not be reached.
    Unknown,
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Absent => "absent",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Derived status surfaced by the registry. `Error` marks an instance whose
/// on-disk state is inconsistent (directory present, config unreadable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Running,
    Stopped,
    Absent,
    Unknown,
    Error,
}

impl From<ProcessStatus> for InstanceStatus {
    fn from(s: ProcessStatus) -> Self {
        match s {
            ProcessStatus::Running => Self::Running,
            ProcessStatus::Stopped => Self::Stopped,
            ProcessStatus::Absent => Self::Absent,
            ProcessStatus::Unknown => Self::Unknown,
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Absent => "absent",
            Self::Unknown => "unknown",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// One provisioned bot deployment.
#[derive(Debug, Clone)]
pub struct Instance {
    /// Unique, immutable identifier. All resource names derive from it.
    pub slug: String,
    pub display_name: String,
    pub directory: PathBuf,
    pub database_name: String,
    pub database_role: String,
    pub database_password: Secret,
    pub created_at: DateTime<Utc>,
}

impl Instance {
    /// Assemble an instance with all names derived from the slug.
    pub fn derive(cfg: &GlobalConfig, slug: &str, display_name: &str, password: Secret) -> Self {
        Self {
            slug: slug.to_string(),
            display_name: display_name.to_string(),
            directory: instance_dir(cfg, slug),
            database_name: database_name(slug),
            database_role: database_role(slug),
            database_password: password,
            created_at: Utc::now(),
        }
    }

    pub fn env_path(&self) -> PathBuf {
        self.directory.join(ENV_FILE)
    }

    pub fn descriptor_path(&self) -> PathBuf {
        self.directory.join(DESCRIPTOR_FILE)
    }

    /// Supervisor process name for this instance.
    pub fn process_name(&self) -> String {
        process_name(&self.slug)
    }
}

/// Listing row produced by the registry.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSummary {
    pub slug: String,
    pub display_name: String,
    pub status: InstanceStatus,
    /// Populated for `status = error` rows: why the instance is inconsistent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

pub fn instance_dir(cfg: &GlobalConfig, slug: &str) -> PathBuf {
    cfg.instances_root.join(slug)
}

/// Database identifiers only allow underscores, so hyphens are mapped.
pub fn database_name(slug: &str) -> String {
    format!("bot_{}", slug.replace('-', "_"))
}

pub fn database_role(slug: &str) -> String {
    database_name(slug)
}

pub fn process_name(slug: &str) -> String {
    format!("bot-{}", slug)
}

/// Maximum slug length; keeps derived database identifiers well under the
/// engine's 63-byte identifier limit.
pub const MAX_SLUG_LEN: usize = 32;

/// Validate a slug: 2-32 chars, lowercase ASCII alphanumeric plus `-`,
/// starting with a letter, no trailing or doubled hyphens.
pub fn validate_slug(slug: &str) -> FleetResult<()> {
    if slug.len() < 2 || slug.len() > MAX_SLUG_LEN {
        return Err(FleetError::Validation(format!(
            "slug '{}' must be 2-{} characters",
            slug, MAX_SLUG_LEN
        )));
    }
    if !slug.chars().next().is_some_and(|c| c.is_ascii_lowercase()) {
        return Err(FleetError::Validation(format!(
            "slug '{}' must start with a lowercase letter",
            slug
        )));
    }
    if !slug
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(FleetError::Validation(format!(
            "slug '{}' may only contain lowercase letters, digits and '-'",
            slug
        )));
    }
    if slug.ends_with('-') || slug.contains("--") {
        return Err(FleetError::Validation(format!(
            "slug '{}' has a trailing or doubled '-'",
            slug
        )));
    }
    Ok(())
}
