//! Instance lifecycle orchestrator.
//!
//! Sequences multi-step operations across the database provisioner, the
//! process supervisor and the filesystem, and compensates for partial
//! failure: a failed `create` must leave nothing behind, a failed step in
//! `delete` must not block forward progress. Every operation holds the
//! instance's slug lock for its full duration; locks release on all exit
//! paths.

use crate::backup::BackupEngine;
use crate::config::GlobalConfig;
use crate::db::DatabaseProvisioner;
use crate::error::{FleetError, FleetResult, OpReport};
use crate::instance::{
    validate_slug, Instance, InstanceStatus, InstanceSummary, ProcessStatus, Secret,
};
use crate::locks::SlugLocks;
use crate::materialize::Materializer;
use crate::process::ProcessSupervisor;
use crate::registry::Registry;
use crate::secret::{generate_password, DEFAULT_PASSWORD_LEN};
use crate::utils::{copy_dir_recursive, run_with_timeout};
use anyhow::anyhow;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

/// Optional migration hook run during `update`, best-effort.
const MIGRATE_HOOK: &str = "migrate.sh";

pub struct Orchestrator {
    cfg: GlobalConfig,
    db: Arc<dyn DatabaseProvisioner>,
    supervisor: Arc<dyn ProcessSupervisor>,
    registry: Registry,
    backups: BackupEngine,
    locks: SlugLocks,
}

impl Orchestrator {
    pub fn new(
        cfg: GlobalConfig,
        db: Arc<dyn DatabaseProvisioner>,
        supervisor: Arc<dyn ProcessSupervisor>,
    ) -> Self {
        let registry = Registry::new(&cfg);
        let backups = BackupEngine::new(cfg.backups_root.clone());
        Self {
            cfg,
            db,
            supervisor,
            registry,
            backups,
            locks: SlugLocks::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn backups(&self) -> &BackupEngine {
        &self.backups
    }

    /// Aggregate listing with live status per instance.
    pub async fn list(&self) -> FleetResult<Vec<InstanceSummary>> {
        self.registry.list(self.supervisor.as_ref()).await
    }

    pub async fn status(&self, slug: &str) -> FleetResult<(Instance, InstanceStatus)> {
        self.registry.get(slug, self.supervisor.as_ref()).await
    }

    /// Create a new instance: validate -> generate secret -> provision
    /// database -> populate directory -> materialize config -> start.
    /// Any failure after provisioning rolls back everything created so far;
    /// a half-created instance must never be visible to the registry.
    pub async fn create(&self, slug: &str, display_name: Option<&str>) -> FleetResult<OpReport> {
        validate_slug(slug)?;
        let _guard = self.locks.acquire(slug)?;

        if self.registry.exists(slug) {
            return Err(FleetError::Conflict(format!(
                "instance '{}' already exists",
                slug
            )));
        }

        let mut report = OpReport::ok();
        let password = Secret(generate_password(DEFAULT_PASSWORD_LEN));
        let display_name = display_name.unwrap_or(slug);
        let instance = Instance::derive(&self.cfg, slug, display_name, password);

        tracing::info!("Creating instance '{}'", slug);
        self.db
            .provision(
                &instance.database_name,
                &instance.database_role,
                instance.database_password.expose(),
            )
            .await?;

        if let Err(e) = self.populate_and_start(&instance, &mut report).await {
            let (rolled_back, rollback_failures) = self.rollback_create(&instance).await;
            return Err(FleetError::PartialFailure {
                operation: "create".to_string(),
                failed_step: e.step,
                cause: e.cause,
                rolled_back,
                rollback_failures,
            });
        }

        tracing::info!("Instance '{}' created and running", slug);
        Ok(report)
    }

    /// Steps of `create` that come after provisioning; isolated so a failure
    /// carries the step name into the rollback report.
    async fn populate_and_start(
        &self,
        instance: &Instance,
        report: &mut OpReport,
    ) -> Result<(), StepFailure> {
        if self.cfg.bot_template_dir.is_dir() {
            copy_dir_recursive(&self.cfg.bot_template_dir, &instance.directory)
                .map_err(|e| StepFailure::new("populate directory", e))?;
        } else {
            report.warn(format!(
                "bot template {} not found; instance directory starts empty",
                self.cfg.bot_template_dir.display()
            ));
            std::fs::create_dir_all(&instance.directory)
                .map_err(|e| StepFailure::new("populate directory", e.into()))?;
        }

        Materializer::new(&self.cfg)
            .materialize(instance)
            .map_err(|e| StepFailure::new("materialize config", e))?;

        self.supervisor
            .start(&instance.process_name(), &instance.descriptor_path())
            .await
            .map_err(|e| StepFailure::new("start process", anyhow!(e)))?;

        self.wait_for_running(&instance.process_name())
            .await
            .map_err(|e| StepFailure::new("verify process running", anyhow!(e)))?;
        Ok(())
    }

    /// Compensating rollback for `create`: undo in reverse order. Failures
    /// are collected, never raised, so the operator sees one report.
    async fn rollback_create(&self, instance: &Instance) -> (Vec<String>, Vec<String>) {
        let mut rolled_back = Vec::new();
        let mut failures = Vec::new();

        match self.supervisor.remove(&instance.process_name()).await {
            Ok(()) => rolled_back.push(format!("removed process '{}'", instance.process_name())),
            Err(e) => failures.push(format!("remove process '{}': {}", instance.process_name(), e)),
        }
        match self
            .db
            .deprovision(&instance.database_name, &instance.database_role)
            .await
        {
            Ok(_) => rolled_back.push(format!("dropped database '{}'", instance.database_name)),
            Err(e) => failures.push(format!("drop database '{}': {}", instance.database_name, e)),
        }
        if instance.directory.exists() {
            match std::fs::remove_dir_all(&instance.directory) {
                Ok(()) => rolled_back.push(format!("removed {}", instance.directory.display())),
                Err(e) => failures.push(format!("remove {}: {}", instance.directory.display(), e)),
            }
        }
        (rolled_back, failures)
    }

    /// Update an instance in place: mandatory snapshot -> stop -> refresh
    /// code -> best-effort migration -> re-materialize -> restart -> verify.
    /// No automatic rollback on verification failure; the report points the
    /// operator at the pre-update snapshot instead.
    pub async fn update(&self, slug: &str) -> FleetResult<OpReport> {
        let _guard = self.locks.acquire(slug)?;
        let instance = self.registry.load(slug)?;
        let mut report = OpReport::ok();

        tracing::info!("Updating instance '{}'", slug);
        let snapshot = self.backups.snapshot(&instance, self.db.as_ref()).await?;

        self.supervisor.stop(&instance.process_name()).await?;

        if self.cfg.bot_template_dir.is_dir() {
            copy_dir_recursive(&self.cfg.bot_template_dir, &instance.directory)
                .map_err(FleetError::Internal)?;
        } else {
            report.warn(format!(
                "bot template {} not found; code not refreshed",
                self.cfg.bot_template_dir.display()
            ));
        }

        if let Err(e) = self.run_migration_hook(&instance).await {
            report.warn(format!(
                "migration hook failed for '{}': {} (pre-update snapshot: {})",
                slug,
                e,
                snapshot.archive_path.display()
            ));
        }

        Materializer::new(&self.cfg)
            .materialize(&instance)
            .map_err(FleetError::Internal)?;

        let name = instance.process_name();
        match self.supervisor.status(&name).await {
            ProcessStatus::Absent => {
                self.supervisor
                    .start(&name, &instance.descriptor_path())
                    .await?
            }
            _ => self.supervisor.restart(&name).await?,
        }

        if let Err(e) = self.wait_for_running(&name).await {
            // Reverting code over a possibly half-applied migration is
            // unsafe, so the decision is left to the operator.
            return Err(FleetError::Timeout {
                waiting_for: format!(
                    "instance '{}' to come back after update (pre-update snapshot: {}); {}",
                    slug,
                    snapshot.archive_path.display(),
                    e
                ),
                seconds: self.cfg.start_timeout_secs,
            });
        }

        tracing::info!("Instance '{}' updated", slug);
        Ok(report)
    }

    /// Run `migrate.sh` from the instance directory when present.
    async fn run_migration_hook(&self, instance: &Instance) -> FleetResult<()> {
        let hook = instance.directory.join(MIGRATE_HOOK);
        if !hook.exists() {
            return Ok(());
        }
        tracing::info!("Running migration hook for '{}'", instance.slug);
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg(MIGRATE_HOOK)
            .current_dir(&instance.directory)
            .env("ENV_FILE", instance.env_path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let out = run_with_timeout(
            cmd,
            None,
            Duration::from_secs(self.cfg.db_timeout_secs),
            "migration hook",
        )
        .await?;
        if !out.success {
            return Err(FleetError::Internal(anyhow!(
                "{} exited with failure: {}",
                MIGRATE_HOOK,
                out.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Delete an instance: snapshot (unless declined) -> stop and remove the
    /// process -> drop the database (non-fatal) -> remove the directory.
    /// Deprovision failure degrades to a warning; forward progress on
    /// deletion is prioritized over perfect cleanliness.
    pub async fn delete(&self, slug: &str, skip_snapshot: bool) -> FleetResult<OpReport> {
        let _guard = self.locks.acquire(slug)?;
        if !self.registry.exists(slug) {
            return Err(FleetError::NotFound(slug.to_string()));
        }
        let mut report = OpReport::ok();

        tracing::info!("Deleting instance '{}' (snapshot: {})", slug, !skip_snapshot);

        // Inconsistent instances still get deleted; identity falls back to
        // derived names so resource cleanup can proceed.
        let instance = match self.registry.load(slug) {
            Ok(instance) => instance,
            Err(e) => {
                report.warn(format!("instance '{}' is inconsistent ({}); deleting anyway", slug, e));
                Instance::derive(&self.cfg, slug, slug, Secret(String::new()))
            }
        };

        if skip_snapshot {
            report.warn(format!("deleting '{}' without a recovery snapshot", slug));
        } else {
            let snapshot = self.backups.snapshot(&instance, self.db.as_ref()).await?;
            tracing::info!("Pre-delete snapshot at {}", snapshot.archive_path.display());
        }

        let name = instance.process_name();
        if let Err(e) = self.supervisor.stop(&name).await {
            report.warn(format!("failed to stop process '{}': {}", name, e));
        }
        if let Err(e) = self.supervisor.remove(&name).await {
            report.warn(format!(
                "failed to remove process '{}' from the supervisor: {} -- clean up manually",
                name, e
            ));
        }

        match self
            .db
            .deprovision(&instance.database_name, &instance.database_role)
            .await
        {
            Ok(true) => {}
            Ok(false) => tracing::info!("Database '{}' already absent", instance.database_name),
            Err(e) => report.warn(format!(
                "failed to drop database '{}': {} -- orphaned database requires manual cleanup",
                instance.database_name, e
            )),
        }

        std::fs::remove_dir_all(&instance.directory).map_err(|e| {
            FleetError::Internal(anyhow!(
                "failed to remove {}: {}",
                instance.directory.display(),
                e
            ))
        })?;

        tracing::info!("Instance '{}' deleted", slug);
        Ok(report)
    }

    pub async fn start(&self, slug: &str) -> FleetResult<OpReport> {
        let _guard = self.locks.acquire(slug)?;
        let instance = self.registry.load(slug)?;
        self.supervisor
            .start(&instance.process_name(), &instance.descriptor_path())
            .await?;
        self.wait_for_running(&instance.process_name()).await?;
        Ok(OpReport::ok())
    }

    pub async fn stop(&self, slug: &str) -> FleetResult<OpReport> {
        let _guard = self.locks.acquire(slug)?;
        let instance = self.registry.load(slug)?;
        self.supervisor.stop(&instance.process_name()).await?;
        Ok(OpReport::ok())
    }

    pub async fn restart(&self, slug: &str) -> FleetResult<OpReport> {
        let _guard = self.locks.acquire(slug)?;
        let instance = self.registry.load(slug)?;
        let name = instance.process_name();
        match self.supervisor.status(&name).await {
            ProcessStatus::Absent => {
                self.supervisor
                    .start(&name, &instance.descriptor_path())
                    .await?
            }
            _ => self.supervisor.restart(&name).await?,
        }
        self.wait_for_running(&name).await?;
        Ok(OpReport::ok())
    }

    /// On-demand snapshot of one instance.
    pub async fn backup(&self, slug: &str) -> FleetResult<crate::backup::Snapshot> {
        let _guard = self.locks.acquire(slug)?;
        let instance = self.registry.load(slug)?;
        self.backups.snapshot(&instance, self.db.as_ref()).await
    }

    /// Snapshot every registered instance sequentially, collecting
    /// per-instance failures instead of aborting at the first one.
    pub async fn backup_all(&self) -> FleetResult<OpReport> {
        let mut report = OpReport::ok();
        for slug in self.registry.slugs()? {
            if let Err(e) = self.backup(&slug).await {
                report.warn(format!("backup of '{}' failed: {}", slug, e));
            }
        }
        Ok(report)
    }

    /// Update every registered instance sequentially.
    pub async fn update_all(&self) -> FleetResult<OpReport> {
        let mut report = OpReport::ok();
        for slug in self.registry.slugs()? {
            match self.update(&slug).await {
                Ok(r) => report.merge(r),
                Err(e) => report.warn(format!("update of '{}' failed: {}", slug, e)),
            }
        }
        Ok(report)
    }

    /// Restore an archive. When the instance no longer exists this is the
    /// restore-into-new-instance flow: the database is provisioned with the
    /// archived credentials first. The restored instance is left stopped.
    pub async fn restore(&self, archive: &Path) -> FleetResult<OpReport> {
        let (manifest, env) = self.backups.peek(archive)?;
        let slug = manifest.instance_slug.clone();
        validate_slug(&slug)?;
        let _guard = self.locks.acquire(&slug)?;
        let mut report = OpReport::ok();

        tracing::info!("Restoring '{}' from {}", slug, archive.display());

        let instance = if self.registry.exists(&slug) {
            report.warn(format!(
                "overwriting live state of existing instance '{}' from archive",
                slug
            ));
            self.registry.load(&slug)?
        } else {
            let env = env.ok_or_else(|| {
                FleetError::Internal(anyhow!(
                    "archive has no env file; cannot recover credentials for a new instance"
                ))
            })?;
            let password = env.get("DB_PASSWORD").map(str::to_string).ok_or_else(|| {
                FleetError::Internal(anyhow!("archived env file is missing DB_PASSWORD"))
            })?;
            let display_name = env.get("BOT_NAME").unwrap_or(&slug).to_string();
            let mut instance = Instance::derive(&self.cfg, &slug, &display_name, Secret(password));
            // Keep the original creation time so re-materialization does not
            // rewrite BOT_CREATED_AT.
            if let Some(created) = env
                .get("BOT_CREATED_AT")
                .and_then(|v| chrono::DateTime::parse_from_rfc3339(v).ok())
            {
                instance.created_at = created.with_timezone(&chrono::Utc);
            }
            instance
        };

        if !self.db.exists(&instance.database_name).await? {
            self.db
                .provision(
                    &instance.database_name,
                    &instance.database_role,
                    instance.database_password.expose(),
                )
                .await?;
        }

        self.backups
            .restore(archive, &instance, self.db.as_ref())
            .await?;

        // Reconcile managed keys and the descriptor with the current host
        // configuration; archived operator edits survive the merge.
        Materializer::new(&self.cfg)
            .materialize(&instance)
            .map_err(FleetError::Internal)?;

        report.warn(format!(
            "instance '{}' restored in stopped state; start it with: botfleet start {}",
            slug, slug
        ));
        Ok(report)
    }

    /// Delete snapshots older than the configured retention window.
    pub fn sweep_backups(&self) -> FleetResult<Vec<std::path::PathBuf>> {
        self.backups.sweep(self.cfg.backup_retention_days)
    }

    /// Poll the supervisor until the process reports running, bounded by the
    /// configured start timeout.
    async fn wait_for_running(&self, name: &str) -> FleetResult<()> {
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.cfg.start_timeout_secs);
        loop {
            if self.supervisor.status(name).await == ProcessStatus::Running {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(FleetError::Timeout {
                    waiting_for: format!("process '{}' to reach running state", name),
                    seconds: self.cfg.start_timeout_secs,
                });
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }
}

/// A failed step inside a compensatable sequence.
struct StepFailure {
    step: String,
    cause: String,
}

impl StepFailure {
    fn new(step: &str, cause: anyhow::Error) -> Self {
        Self {
            step: step.to_string(),
            cause: cause.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// In-memory database engine with failure injection.
    #[derive(Default)]
    struct FakeDb {
        databases: Mutex<HashMap<String, Vec<u8>>>,
        fail_provision: AtomicBool,
        fail_deprovision: AtomicBool,
    }

    #[async_trait]
    impl DatabaseProvisioner for FakeDb {
        async fn provision(&self, database: &str, _role: &str, _password: &str) -> FleetResult<()> {
            if self.fail_provision.load(Ordering::Relaxed) {
                return Err(FleetError::Internal(anyhow!("injected provision failure")));
            }
            let mut dbs = self.databases.lock().unwrap();
            if dbs.contains_key(database) {
                return Err(FleetError::Conflict(format!(
                    "database '{}' already exists",
                    database
                )));
            }
            dbs.insert(database.to_string(), format!("-- schema {}", database).into_bytes());
            Ok(())
        }

        async fn deprovision(&self, database: &str, _role: &str) -> FleetResult<bool> {
            if self.fail_deprovision.load(Ordering::Relaxed) {
                return Err(FleetError::Internal(anyhow!("injected deprovision failure")));
            }
            Ok(self.databases.lock().unwrap().remove(database).is_some())
        }

        async fn dump(&self, database: &str) -> FleetResult<Vec<u8>> {
            self.databases
                .lock()
                .unwrap()
                .get(database)
                .cloned()
                .ok_or_else(|| FleetError::NotFound(database.to_string()))
        }

        async fn restore(&self, database: &str, dump: &[u8]) -> FleetResult<()> {
            self.databases
                .lock()
                .unwrap()
                .insert(database.to_string(), dump.to_vec());
            Ok(())
        }

        async fn exists(&self, database: &str) -> FleetResult<bool> {
            Ok(self.databases.lock().unwrap().contains_key(database))
        }
    }

    /// In-memory supervisor with failure injection.
    #[derive(Default)]
    struct FakeSupervisor {
        processes: Mutex<HashMap<String, ProcessStatus>>,
        fail_start: AtomicBool,
    }

    #[async_trait]
    impl ProcessSupervisor for FakeSupervisor {
        async fn start(&self, name: &str, _descriptor: &Path) -> FleetResult<()> {
            if self.fail_start.load(Ordering::Relaxed) {
                return Err(FleetError::Internal(anyhow!("injected start failure")));
            }
            self.processes
                .lock()
                .unwrap()
                .insert(name.to_string(), ProcessStatus::Running);
            Ok(())
        }

        async fn stop(&self, name: &str) -> FleetResult<()> {
            if let Some(status) = self.processes.lock().unwrap().get_mut(name) {
                *status = ProcessStatus::Stopped;
            }
            Ok(())
        }

        async fn restart(&self, name: &str) -> FleetResult<()> {
            let mut procs = self.processes.lock().unwrap();
            match procs.get_mut(name) {
                Some(status) => {
                    *status = ProcessStatus::Running;
                    Ok(())
                }
                None => Err(FleetError::Internal(anyhow!("process '{}' not found", name))),
            }
        }

        async fn status(&self, name: &str) -> ProcessStatus {
            self.processes
                .lock()
                .unwrap()
                .get(name)
                .copied()
                .unwrap_or(ProcessStatus::Absent)
        }

        async fn remove(&self, name: &str) -> FleetResult<()> {
            self.processes.lock().unwrap().remove(name);
            Ok(())
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        cfg: GlobalConfig,
        db: Arc<FakeDb>,
        supervisor: Arc<FakeSupervisor>,
        orchestrator: Orchestrator,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = GlobalConfig::default();
        cfg.instances_root = dir.path().join("instances");
        cfg.backups_root = dir.path().join("backups");
        cfg.bot_template_dir = dir.path().join("template");
        cfg.start_timeout_secs = 1;
        std::fs::create_dir_all(&cfg.bot_template_dir).unwrap();
        std::fs::write(cfg.bot_template_dir.join("index.js"), "// bot v1").unwrap();

        let db = Arc::new(FakeDb::default());
        let supervisor = Arc::new(FakeSupervisor::default());
        let orchestrator = Orchestrator::new(cfg.clone(), db.clone(), supervisor.clone());
        Harness {
            _dir: dir,
            cfg,
            db,
            supervisor,
            orchestrator,
        }
    }

    #[tokio::test]
    async fn create_then_status_is_running() {
        let h = harness();
        h.orchestrator.create("alpha", Some("Alpha Bot")).await.unwrap();

        let (instance, status) = h.orchestrator.status("alpha").await.unwrap();
        assert_eq!(status, InstanceStatus::Running);
        assert_eq!(instance.display_name, "Alpha Bot");
        assert_eq!(instance.database_name, "bot_alpha");
        assert!(instance.directory.join("index.js").exists());
        assert!(h.db.databases.lock().unwrap().contains_key("bot_alpha"));
    }

    #[tokio::test]
    async fn list_contains_exactly_created_instance() {
        let h = harness();
        h.orchestrator.create("alpha", None).await.unwrap();

        let list = h.orchestrator.list().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].slug, "alpha");
        assert_eq!(list[0].status, InstanceStatus::Running);
    }

    #[tokio::test]
    async fn invalid_slug_has_no_side_effects() {
        let h = harness();
        let err = h.orchestrator.create("Not Valid!", None).await.unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(!h.cfg.instances_root.exists() || h.orchestrator.list().await.unwrap().is_empty());
        assert!(h.db.databases.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_create_is_conflict() {
        let h = harness();
        h.orchestrator.create("alpha", None).await.unwrap();
        let err = h.orchestrator.create("alpha", None).await.unwrap_err();
        assert!(matches!(err, FleetError::Conflict(_)));
    }

    #[tokio::test]
    async fn provision_failure_leaves_no_artifacts() {
        let h = harness();
        h.db.fail_provision.store(true, Ordering::Relaxed);

        let err = h.orchestrator.create("alpha", None).await.unwrap_err();
        assert_eq!(err.exit_code(), 1);
        assert!(!h.cfg.instances_root.join("alpha").exists());
        assert!(h.db.databases.lock().unwrap().is_empty());
        assert!(h.supervisor.processes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn materialize_failure_rolls_back_database() {
        let h = harness();
        // A plain file squatting on the instance path makes directory
        // creation fail after provisioning succeeded.
        std::fs::create_dir_all(&h.cfg.instances_root).unwrap();
        std::fs::write(h.cfg.instances_root.join("alpha"), "squatter").unwrap();

        let err = h.orchestrator.create("alpha", None).await.unwrap_err();
        match err {
            FleetError::PartialFailure { rolled_back, .. } => {
                assert!(rolled_back.iter().any(|s| s.contains("bot_alpha")));
            }
            other => panic!("expected PartialFailure, got {:?}", other),
        }
        assert!(!h.db.databases.lock().unwrap().contains_key("bot_alpha"));
    }

    #[tokio::test]
    async fn start_failure_rolls_back_database_and_directory() {
        let h = harness();
        h.supervisor.fail_start.store(true, Ordering::Relaxed);

        let err = h.orchestrator.create("alpha", None).await.unwrap_err();
        match err {
            FleetError::PartialFailure { failed_step, rolled_back, rollback_failures, .. } => {
                assert_eq!(failed_step, "start process");
                assert!(rollback_failures.is_empty());
                assert!(rolled_back.iter().any(|s| s.contains("bot_alpha")));
            }
            other => panic!("expected PartialFailure, got {:?}", other),
        }
        assert!(!h.cfg.instances_root.join("alpha").exists());
        assert!(h.db.databases.lock().unwrap().is_empty());
        assert!(h.orchestrator.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let h = harness();
        h.orchestrator.create("alpha", None).await.unwrap();

        h.orchestrator.delete("alpha", true).await.unwrap();
        assert!(h.orchestrator.list().await.unwrap().is_empty());
        assert!(!h.cfg.instances_root.join("alpha").exists());

        let err = h.orchestrator.delete("alpha", true).await.unwrap_err();
        assert!(matches!(err, FleetError::NotFound(_)));
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test]
    async fn delete_takes_snapshot_by_default() {
        let h = harness();
        h.orchestrator.create("alpha", None).await.unwrap();
        h.orchestrator.delete("alpha", false).await.unwrap();

        let archives = h.orchestrator.backups().list_archives(Some("alpha")).unwrap();
        assert_eq!(archives.len(), 1);
    }

    #[tokio::test]
    async fn delete_completes_despite_deprovision_failure() {
        let h = harness();
        h.orchestrator.create("alpha", None).await.unwrap();
        h.db.fail_deprovision.store(true, Ordering::Relaxed);

        let report = h.orchestrator.delete("alpha", true).await.unwrap();
        assert!(report
            .warnings
            .iter()
            .any(|w| w.contains("orphaned database")));
        assert!(!h.cfg.instances_root.join("alpha").exists());
        assert!(h.orchestrator.list().await.unwrap().is_empty());
        // The orphan is still there, reported for manual cleanup.
        assert!(h.db.databases.lock().unwrap().contains_key("bot_alpha"));
    }

    #[tokio::test]
    async fn update_takes_snapshot_and_restarts() {
        let h = harness();
        h.orchestrator.create("alpha", None).await.unwrap();
        std::fs::write(h.cfg.bot_template_dir.join("index.js"), "// bot v2").unwrap();

        let report = h.orchestrator.update("alpha").await.unwrap();
        assert!(report.warnings.is_empty());

        let archives = h.orchestrator.backups().list_archives(Some("alpha")).unwrap();
        assert_eq!(archives.len(), 1);
        let code = std::fs::read_to_string(h.cfg.instances_root.join("alpha/index.js")).unwrap();
        assert_eq!(code, "// bot v2");
        let (_, status) = h.orchestrator.status("alpha").await.unwrap();
        assert_eq!(status, InstanceStatus::Running);
    }

    #[tokio::test]
    async fn update_with_failing_migration_still_restarts() {
        let h = harness();
        h.orchestrator.create("alpha", None).await.unwrap();
        std::fs::write(
            h.cfg.instances_root.join("alpha").join(MIGRATE_HOOK),
            "#!/bin/sh\nexit 1\n",
        )
        .unwrap();

        let report = h.orchestrator.update("alpha").await.unwrap();
        assert!(report.warnings.iter().any(|w| w.contains("migration hook failed")));
        assert!(report.warnings.iter().any(|w| w.contains("snapshot")));

        // Instance still listed and running, snapshot present.
        let list = h.orchestrator.list().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].status, InstanceStatus::Running);
        assert_eq!(
            h.orchestrator.backups().list_archives(Some("alpha")).unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn update_preserves_operator_env_edits() {
        let h = harness();
        h.orchestrator.create("alpha", None).await.unwrap();
        let env_path = h.cfg.instances_root.join("alpha/instance.env");
        let mut env = crate::instance::envfile::EnvFile::load(&env_path).unwrap();
        env.set("WEBHOOK_URL", "https://example.com/hook");
        env.write(&env_path).unwrap();

        h.orchestrator.update("alpha").await.unwrap();

        let env = crate::instance::envfile::EnvFile::load(&env_path).unwrap();
        assert_eq!(env.get("WEBHOOK_URL"), Some("https://example.com/hook"));
    }

    #[tokio::test]
    async fn same_slug_operations_are_serialized() {
        let h = harness();
        h.orchestrator.create("alpha", None).await.unwrap();

        let _guard = h.orchestrator.locks.acquire("alpha").unwrap();
        let err = h.orchestrator.update("alpha").await.unwrap_err();
        match err {
            FleetError::Conflict(msg) => assert!(msg.contains("already in progress")),
            other => panic!("expected Conflict, got {:?}", other),
        }

        // A different slug is not blocked.
        h.orchestrator.create("beta", None).await.unwrap();
    }

    #[tokio::test]
    async fn backup_restore_round_trip_into_fresh_instance() {
        let h = harness();
        h.orchestrator.create("alpha", None).await.unwrap();
        let env_before = std::fs::read_to_string(h.cfg.instances_root.join("alpha/instance.env")).unwrap();
        let snapshot = h.orchestrator.backup("alpha").await.unwrap();

        // Wipe the instance entirely, then restore from the archive.
        h.orchestrator.delete("alpha", true).await.unwrap();
        assert!(h.db.databases.lock().unwrap().is_empty());

        let report = h.orchestrator.restore(&snapshot.archive_path).await.unwrap();
        assert!(report.warnings.iter().any(|w| w.contains("stopped state")));

        let restored = h.orchestrator.registry().load("alpha").unwrap();
        assert_eq!(restored.database_name, "bot_alpha");
        assert_eq!(
            h.db.databases.lock().unwrap().get("bot_alpha").unwrap(),
            b"-- schema bot_alpha"
        );
        let env_after = std::fs::read_to_string(h.cfg.instances_root.join("alpha/instance.env")).unwrap();
        assert_eq!(env_before, env_after);
    }

    #[tokio::test]
    async fn backup_all_collects_per_instance_failures() {
        let h = harness();
        h.orchestrator.create("alpha", None).await.unwrap();
        h.orchestrator.create("beta", None).await.unwrap();
        // Break beta's database so its backup fails.
        h.db.databases.lock().unwrap().remove("bot_beta");

        let report = h.orchestrator.backup_all().await.unwrap();
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("beta"));
        assert_eq!(
            h.orchestrator.backups().list_archives(Some("alpha")).unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn sweep_respects_retention_window() {
        let h = harness();
        h.orchestrator.create("alpha", None).await.unwrap();
        h.orchestrator.backup("alpha").await.unwrap();
        std::fs::write(
            h.cfg.backups_root.join("alpha_20200101-000000.zip"),
            b"old",
        )
        .unwrap();

        let removed = h.orchestrator.sweep_backups().unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(
            h.orchestrator.backups().list_archives(Some("alpha")).unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn start_stop_restart_cycle() {
        let h = harness();
        h.orchestrator.create("alpha", None).await.unwrap();

        h.orchestrator.stop("alpha").await.unwrap();
        let (_, status) = h.orchestrator.status("alpha").await.unwrap();
        assert_eq!(status, InstanceStatus::Stopped);

        h.orchestrator.restart("alpha").await.unwrap();
        let (_, status) = h.orchestrator.status("alpha").await.unwrap();
        assert_eq!(status, InstanceStatus::Running);
    }
}
