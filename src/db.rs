//! Database provisioner: a per-instance database and role on a Postgres
//! engine, plus logical dump/restore.
//!
//! The orchestrator only sees the `DatabaseProvisioner` trait; the concrete
//! adapter shells out to `psql` / `pg_dump` with administrative credentials
//! and bounded timeouts.

use crate::config::DatabaseConfig;
use crate::error::{FleetError, FleetResult};
use crate::utils::{run_with_timeout, CmdOutput};
use anyhow::anyhow;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

#[async_trait]
pub trait DatabaseProvisioner: Send + Sync {
    /// Create a dedicated database and a role scoped to it. Fails with
    /// `Conflict` when the database already exists.
    async fn provision(&self, database: &str, role: &str, password: &str) -> FleetResult<()>;

    /// Drop the database and role. Idempotent: returns `false` when the
    /// database was already absent, which the delete path logs and treats
    /// as satisfied.
    async fn deprovision(&self, database: &str, role: &str) -> FleetResult<bool>;

    /// Full logical dump of the database.
    async fn dump(&self, database: &str) -> FleetResult<Vec<u8>>;

    /// Restore a dump into an existing database. Destructive: overwrites
    /// current contents.
    async fn restore(&self, database: &str, dump: &[u8]) -> FleetResult<()>;

    async fn exists(&self, database: &str) -> FleetResult<bool>;
}

/// Concrete adapter over the `psql` / `pg_dump` CLI tools.
pub struct PostgresProvisioner {
    cfg: DatabaseConfig,
    timeout: Duration,
    psql_bin: String,
    pg_dump_bin: String,
}

impl PostgresProvisioner {
    pub fn new(cfg: DatabaseConfig, timeout_secs: u64) -> Self {
        Self {
            cfg,
            timeout: Duration::from_secs(timeout_secs),
            psql_bin: "psql".to_string(),
            pg_dump_bin: "pg_dump".to_string(),
        }
    }

    /// Base command with admin connection parameters applied.
    fn build_command(&self, bin: &str) -> Command {
        let mut cmd = Command::new(bin);
        cmd.arg("-h")
            .arg(&self.cfg.host)
            .arg("-p")
            .arg(self.cfg.port.to_string())
            .arg("-U")
            .arg(&self.cfg.admin_user)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(password) = &self.cfg.admin_password {
            cmd.env("PGPASSWORD", password);
        }
        cmd
    }

    /// psql invocation that reads its statements from stdin. Statements can
    /// embed credentials (CREATE ROLE ... PASSWORD), so they must never be
    /// passed as arguments where the process list exposes them.
    fn sql_command(&self, database: &str) -> Command {
        let mut cmd = self.build_command(&self.psql_bin);
        cmd.arg("-v").arg("ON_ERROR_STOP=1").arg("-d").arg(database);
        cmd
    }

    /// Run an administrative SQL statement against the `postgres` database.
    async fn run_sql(&self, sql: &str, what: &str) -> FleetResult<CmdOutput> {
        let cmd = self.sql_command("postgres");
        run_with_timeout(cmd, Some(sql.as_bytes()), self.timeout, what).await
    }
}

/// Quote a string literal for embedding in SQL. Generated passwords are
/// alphanumeric, so this is belt-and-braces for admin-supplied values.
fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[async_trait]
impl DatabaseProvisioner for PostgresProvisioner {
    async fn provision(&self, database: &str, role: &str, password: &str) -> FleetResult<()> {
        if self.exists(database).await? {
            return Err(FleetError::Conflict(format!(
                "database '{}' already exists",
                database
            )));
        }

        let create_role = format!(
            "CREATE ROLE {} LOGIN PASSWORD {}",
            role,
            sql_literal(password)
        );
        let out = self.run_sql(&create_role, "create role").await?;
        if !out.success && !out.stderr.contains("already exists") {
            return Err(FleetError::Internal(anyhow!(
                "failed to create role '{}': {}",
                role,
                out.stderr.trim()
            )));
        }

        let create_db = format!("CREATE DATABASE {} OWNER {}", database, role);
        let out = self.run_sql(&create_db, "create database").await?;
        if !out.success {
            if out.stderr.contains("already exists") {
                return Err(FleetError::Conflict(format!(
                    "database '{}' already exists",
                    database
                )));
            }
            return Err(FleetError::Internal(anyhow!(
                "failed to create database '{}': {}",
                database,
                out.stderr.trim()
            )));
        }
        tracing::info!("Provisioned database '{}' with role '{}'", database, role);
        Ok(())
    }

    async fn deprovision(&self, database: &str, role: &str) -> FleetResult<bool> {
        let existed = self.exists(database).await?;

        let drop_db = format!("DROP DATABASE IF EXISTS {} WITH (FORCE)", database);
        let out = self.run_sql(&drop_db, "drop database").await?;
        if !out.success {
            return Err(FleetError::Internal(anyhow!(
                "failed to drop database '{}': {}",
                database,
                out.stderr.trim()
            )));
        }

        let drop_role = format!("DROP ROLE IF EXISTS {}", role);
        let out = self.run_sql(&drop_role, "drop role").await?;
        if !out.success {
            return Err(FleetError::Internal(anyhow!(
                "failed to drop role '{}': {}",
                role,
                out.stderr.trim()
            )));
        }

        if existed {
            tracing::info!("Dropped database '{}' and role '{}'", database, role);
        } else {
            tracing::info!("Database '{}' was already absent", database);
        }
        Ok(existed)
    }

    async fn dump(&self, database: &str) -> FleetResult<Vec<u8>> {
        let mut cmd = self.build_command(&self.pg_dump_bin);
        cmd.arg("--clean").arg("--if-exists").arg(database);
        let out = run_with_timeout(cmd, None, self.timeout, "database dump").await?;
        if !out.success {
            return Err(FleetError::Internal(anyhow!(
                "pg_dump of '{}' failed: {}",
                database,
                out.stderr.trim()
            )));
        }
        Ok(out.stdout)
    }

    async fn restore(&self, database: &str, dump: &[u8]) -> FleetResult<()> {
        let cmd = self.sql_command(database);
        let out = run_with_timeout(cmd, Some(dump), self.timeout, "database restore").await?;
        if !out.success {
            return Err(FleetError::Internal(anyhow!(
                "restore into '{}' failed: {}",
                database,
                out.stderr.trim()
            )));
        }
        tracing::info!("Restored database '{}' ({} bytes)", database, dump.len());
        Ok(())
    }

    async fn exists(&self, database: &str) -> FleetResult<bool> {
        let sql = format!(
            "SELECT 1 FROM pg_database WHERE datname = {}",
            sql_literal(database)
        );
        let mut cmd = self.sql_command("postgres");
        cmd.arg("-tA");
        let out =
            run_with_timeout(cmd, Some(sql.as_bytes()), self.timeout, "database existence check")
                .await?;
        if !out.success {
            return Err(FleetError::Internal(anyhow!(
                "failed to query pg_database: {}",
                out.stderr.trim()
            )));
        }
        Ok(out.stdout_text().trim() == "1")
    }
}
