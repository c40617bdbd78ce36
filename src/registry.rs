//! Instance registry: the source of truth for which instances exist.
//!
//! Enumeration scans the instances root and reads each subdirectory's
//! materialized config. An unreadable instance is reported with
//! `status = error` rather than omitted -- completeness over convenience.
//! No caching: every call re-reads current on-disk and process state.

use crate::config::GlobalConfig;
use crate::error::{FleetError, FleetResult};
use crate::instance::envfile::EnvFile;
use crate::instance::{
    Instance, InstanceStatus, InstanceSummary, Secret, DESCRIPTOR_FILE, ENV_FILE,
};
use crate::process::ProcessSupervisor;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

pub struct Registry {
    instances_root: PathBuf,
}

impl Registry {
    pub fn new(cfg: &GlobalConfig) -> Self {
        Self {
            instances_root: cfg.instances_root.clone(),
        }
    }

    /// List every instance directory, resolving live status through the
    /// supervisor. Inconsistent instances appear as `status = error` rows.
    pub async fn list(&self, supervisor: &dyn ProcessSupervisor) -> FleetResult<Vec<InstanceSummary>> {
        let mut summaries = Vec::new();
        if !self.instances_root.exists() {
            return Ok(summaries);
        }

        let mut entries: Vec<_> = std::fs::read_dir(&self.instances_root)
            .with_context(|| {
                format!("failed to read instances root {}", self.instances_root.display())
            })
            .map_err(FleetError::Internal)?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .collect();
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let slug = entry.file_name().to_string_lossy().to_string();
            match load_instance(&entry.path()) {
                Ok(instance) => {
                    let status = supervisor.status(&instance.process_name()).await;
                    summaries.push(InstanceSummary {
                        slug: instance.slug,
                        display_name: instance.display_name,
                        status: status.into(),
                        detail: None,
                    });
                }
                Err(e) => {
                    tracing::warn!("Instance '{}' is inconsistent: {}", slug, e);
                    summaries.push(InstanceSummary {
                        slug: slug.clone(),
                        display_name: slug,
                        status: InstanceStatus::Error,
                        detail: Some(e.to_string()),
                    });
                }
            }
        }
        Ok(summaries)
    }

    /// Look up a single instance and resolve its live status.
    pub async fn get(
        &self,
        slug: &str,
        supervisor: &dyn ProcessSupervisor,
    ) -> FleetResult<(Instance, InstanceStatus)> {
        let instance = self.load(slug)?;
        let status = supervisor.status(&instance.process_name()).await;
        Ok((instance, status.into()))
    }

    /// Load an instance from disk without touching the supervisor.
    pub fn load(&self, slug: &str) -> FleetResult<Instance> {
        let dir = self.instances_root.join(slug);
        if !dir.is_dir() {
            return Err(FleetError::NotFound(slug.to_string()));
        }
        load_instance(&dir).map_err(FleetError::Internal)
    }

    pub fn exists(&self, slug: &str) -> bool {
        self.instances_root.join(slug).is_dir()
    }

    /// Slugs of all registered instances, consistent or not. Bulk verbs
    /// iterate this so broken instances still get reported per item.
    pub fn slugs(&self) -> FleetResult<Vec<String>> {
        let mut slugs = Vec::new();
        if !self.instances_root.exists() {
            return Ok(slugs);
        }
        for entry in std::fs::read_dir(&self.instances_root)
            .with_context(|| {
                format!("failed to read instances root {}", self.instances_root.display())
            })
            .map_err(FleetError::Internal)?
        {
            let entry = entry.map_err(|e| FleetError::Internal(e.into()))?;
            if entry.path().is_dir() {
                slugs.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        slugs.sort();
        Ok(slugs)
    }
}

/// Reconstruct an instance from its materialized config. The env file and
/// the process descriptor are the entire on-disk contract; a directory
/// missing either is inconsistent.
fn load_instance(dir: &Path) -> Result<Instance> {
    let env_path = dir.join(ENV_FILE);
    if !env_path.exists() {
        bail!("missing {}", ENV_FILE);
    }
    if !dir.join(DESCRIPTOR_FILE).exists() {
        bail!("missing {} (directory exists but process descriptor is gone)", DESCRIPTOR_FILE);
    }

    let env = EnvFile::load(&env_path)?;
    let require = |key: &str| -> Result<String> {
        env.get(key)
            .map(str::to_string)
            .with_context(|| format!("{} is missing key {}", ENV_FILE, key))
    };

    let slug = require("BOT_SLUG")?;
    let dir_name = dir.file_name().map(|n| n.to_string_lossy().to_string());
    if dir_name.as_deref() != Some(slug.as_str()) {
        bail!(
            "directory name {:?} does not match BOT_SLUG '{}'",
            dir_name.unwrap_or_default(),
            slug
        );
    }

    let created_at = env
        .get("BOT_CREATED_AT")
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Ok(Instance {
        display_name: env.get("BOT_NAME").unwrap_or(&slug).to_string(),
        directory: dir.to_path_buf(),
        database_name: require("DB_NAME")?,
        database_role: require("DB_USER")?,
        database_password: Secret(require("DB_PASSWORD")?),
        created_at,
        slug,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::ProcessStatus;
    use async_trait::async_trait;

    /// Supervisor stub that reports a fixed status for every process.
    struct FixedSupervisor(ProcessStatus);

    #[async_trait]
    impl ProcessSupervisor for FixedSupervisor {
        async fn start(&self, _: &str, _: &Path) -> FleetResult<()> {
            Ok(())
        }
        async fn stop(&self, _: &str) -> FleetResult<()> {
            Ok(())
        }
        async fn restart(&self, _: &str) -> FleetResult<()> {
            Ok(())
        }
        async fn status(&self, _: &str) -> ProcessStatus {
            self.0
        }
        async fn remove(&self, _: &str) -> FleetResult<()> {
            Ok(())
        }
    }

    fn test_cfg(root: &Path) -> GlobalConfig {
        let mut cfg = GlobalConfig::default();
        cfg.instances_root = root.join("instances");
        cfg
    }

    fn materialize_instance(cfg: &GlobalConfig, slug: &str) {
        let instance = Instance::derive(cfg, slug, &format!("Bot {}", slug), Secret("pw".into()));
        crate::materialize::Materializer::new(cfg)
            .materialize(&instance)
            .unwrap();
    }

    #[tokio::test]
    async fn empty_root_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_cfg(dir.path());
        let registry = Registry::new(&cfg);
        let list = registry.list(&FixedSupervisor(ProcessStatus::Running)).await.unwrap();
        assert!(list.is_empty());
    }

    #[tokio::test]
    async fn lists_materialized_instances_with_status() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_cfg(dir.path());
        materialize_instance(&cfg, "alpha");
        materialize_instance(&cfg, "beta");

        let registry = Registry::new(&cfg);
        let list = registry.list(&FixedSupervisor(ProcessStatus::Running)).await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].slug, "alpha");
        assert_eq!(list[0].status, InstanceStatus::Running);
        assert_eq!(list[1].slug, "beta");
    }

    #[tokio::test]
    async fn missing_descriptor_is_reported_as_error() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_cfg(dir.path());
        materialize_instance(&cfg, "alpha");
        std::fs::remove_file(cfg.instances_root.join("alpha").join(DESCRIPTOR_FILE)).unwrap();

        let registry = Registry::new(&cfg);
        let list = registry.list(&FixedSupervisor(ProcessStatus::Running)).await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].status, InstanceStatus::Error);
        assert!(list[0].detail.as_deref().unwrap().contains(DESCRIPTOR_FILE));
    }

    #[tokio::test]
    async fn unparsable_env_is_reported_not_omitted() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_cfg(dir.path());
        let broken_dir = cfg.instances_root.join("broken");
        std::fs::create_dir_all(&broken_dir).unwrap();
        // Directory with neither env file nor descriptor.
        let registry = Registry::new(&cfg);
        let list = registry.list(&FixedSupervisor(ProcessStatus::Stopped)).await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].slug, "broken");
        assert_eq!(list[0].status, InstanceStatus::Error);
    }

    #[tokio::test]
    async fn get_resolves_live_status() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_cfg(dir.path());
        materialize_instance(&cfg, "alpha");

        let registry = Registry::new(&cfg);
        let (instance, status) = registry
            .get("alpha", &FixedSupervisor(ProcessStatus::Stopped))
            .await
            .unwrap();
        assert_eq!(instance.slug, "alpha");
        assert_eq!(instance.database_name, "bot_alpha");
        assert_eq!(instance.database_password.expose(), "pw");
        assert_eq!(status, InstanceStatus::Stopped);
    }

    #[tokio::test]
    async fn get_unknown_slug_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_cfg(dir.path());
        let registry = Registry::new(&cfg);
        let err = registry
            .get("ghost", &FixedSupervisor(ProcessStatus::Running))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::NotFound(_)));
    }

    #[test]
    fn slug_mismatch_is_inconsistent() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_cfg(dir.path());
        materialize_instance(&cfg, "alpha");
        // Rename the directory out from under the env file.
        std::fs::rename(
            cfg.instances_root.join("alpha"),
            cfg.instances_root.join("renamed"),
        )
        .unwrap();

        let registry = Registry::new(&cfg);
        let err = registry.load("renamed").unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }
}
