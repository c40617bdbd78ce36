//! Global configuration, persisted as TOML in the data directory.
//!
//! A missing config file means defaults; every field has one, so a partial
//! file deserializes cleanly. `BOTFLEET_DATA_DIR` overrides the data
//! directory for tests and non-standard deployments.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "fleet.toml";

/// Data directory: `BOTFLEET_DATA_DIR` when set, otherwise the platform's
/// per-user config location.
pub fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("BOTFLEET_DATA_DIR") {
        return PathBuf::from(dir);
    }
    #[cfg(windows)]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("botfleet");
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join("botfleet");
    }
    PathBuf::from(".botfleet")
}

pub fn default_config_path() -> PathBuf {
    default_data_dir().join(CONFIG_FILE)
}

fn default_instances_root() -> PathBuf {
    default_data_dir().join("instances")
}

fn default_backups_root() -> PathBuf {
    default_data_dir().join("backups")
}

fn default_bot_template_dir() -> PathBuf {
    default_data_dir().join("template")
}

fn default_entry_point() -> String {
    "index.js".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_backup_retention_days() -> u32 {
    14
}

fn default_start_timeout_secs() -> u64 {
    30
}

fn default_db_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Parent directory of all instance directories.
    #[serde(default = "default_instances_root")]
    pub instances_root: PathBuf,

    /// Where snapshot archives are written.
    #[serde(default = "default_backups_root")]
    pub backups_root: PathBuf,

    /// Shared bot code copied into each new instance.
    #[serde(default = "default_bot_template_dir")]
    pub bot_template_dir: PathBuf,

    /// Script the supervisor launches inside each instance directory.
    #[serde(default = "default_entry_point")]
    pub entry_point: String,

    #[serde(default = "default_timezone")]
    pub timezone: String,

    #[serde(default = "default_backup_retention_days")]
    pub backup_retention_days: u32,

    /// Shown in error messages so end users know who to contact.
    #[serde(default)]
    pub admin_contact: Option<String>,

    /// Bound on waiting for a process to reach running state.
    #[serde(default = "default_start_timeout_secs")]
    pub start_timeout_secs: u64,

    /// Bound on database dump/restore and migration hooks.
    #[serde(default = "default_db_timeout_secs")]
    pub db_timeout_secs: u64,

    #[serde(default)]
    pub database: DatabaseConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            instances_root: default_instances_root(),
            backups_root: default_backups_root(),
            bot_template_dir: default_bot_template_dir(),
            entry_point: default_entry_point(),
            timezone: default_timezone(),
            backup_retention_days: default_backup_retention_days(),
            admin_contact: None,
            start_timeout_secs: default_start_timeout_secs(),
            db_timeout_secs: default_db_timeout_secs(),
            database: DatabaseConfig::default(),
        }
    }
}

/// Admin connection to the database engine hosting the per-instance
/// databases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub admin_user: String,
    /// Omitted when peer/trust auth applies.
    #[serde(default)]
    pub admin_password: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5432,
            admin_user: "postgres".to_string(),
            admin_password: None,
        }
    }
}

impl GlobalConfig {
    /// Load from a TOML file; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("unparsable config {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("failed to write config {}", path.display()))
    }

    /// Apply one `key = value` setting by dotted name. Configuration changes
    /// only happen through this explicit path, never as a side effect of
    /// another operation.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "instances_root" => self.instances_root = PathBuf::from(value),
            "backups_root" => self.backups_root = PathBuf::from(value),
            "bot_template_dir" => self.bot_template_dir = PathBuf::from(value),
            "entry_point" => self.entry_point = value.to_string(),
            "timezone" => self.timezone = value.to_string(),
            "admin_contact" => self.admin_contact = Some(value.to_string()),
            "backup_retention_days" => {
                self.backup_retention_days = value
                    .parse()
                    .with_context(|| format!("'{}' is not a valid number of days", value))?
            }
            "start_timeout_secs" => {
                self.start_timeout_secs = value
                    .parse()
                    .with_context(|| format!("'{}' is not a valid number of seconds", value))?
            }
            "db_timeout_secs" => {
                self.db_timeout_secs = value
                    .parse()
                    .with_context(|| format!("'{}' is not a valid number of seconds", value))?
            }
            "database.host" => self.database.host = value.to_string(),
            "database.port" => {
                self.database.port = value
                    .parse()
                    .with_context(|| format!("'{}' is not a valid port", value))?
            }
            "database.admin_user" => self.database.admin_user = value.to_string(),
            "database.admin_password" => self.database.admin_password = Some(value.to_string()),
            other => bail!("unknown configuration key '{}'", other),
        }
        Ok(())
    }
}
