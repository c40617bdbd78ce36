//! Command-line surface. Thin by design: parse, build the orchestrator,
//! dispatch, print. All decisions live in the orchestrator.

use crate::config::{default_config_path, GlobalConfig};
use crate::db::PostgresProvisioner;
use crate::error::{FleetError, FleetResult, OpReport};
use crate::orchestrator::Orchestrator;
use crate::process::Pm2Supervisor;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "botfleet", version, about = "Fleet lifecycle manager for tenant-isolated bot instances")]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// List all instances with their live status.
    List,

    /// Create and start a new instance.
    Create {
        slug: String,
        /// Human-readable name; defaults to the slug.
        #[arg(long)]
        name: Option<String>,
    },

    /// Start a stopped instance.
    Start { slug: String },

    /// Stop a running instance.
    Stop { slug: String },

    /// Restart an instance.
    Restart { slug: String },

    /// Delete an instance and all of its resources.
    Delete {
        slug: String,
        /// Skip the pre-delete snapshot. Requires --yes.
        #[arg(long)]
        no_snapshot: bool,
        /// Confirm deleting without a recovery snapshot.
        #[arg(long)]
        yes: bool,
    },

    /// Snapshot one instance, or every instance with --all.
    Backup {
        slug: Option<String>,
        #[arg(long, conflicts_with = "slug")]
        all: bool,
    },

    /// Restore an instance from a snapshot archive.
    Restore { archive: PathBuf },

    /// Refresh an instance's code and config, or every instance with --all.
    Update {
        slug: Option<String>,
        #[arg(long, conflicts_with = "slug")]
        all: bool,
    },

    /// Delete snapshots older than the retention window.
    Sweep,

    /// Show or change global configuration.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration.
    Show,
    /// Set one key, e.g. `config set database.port 5433`.
    Set { key: String, value: String },
}

/// Parse-free entry point for main: dispatch and map the outcome onto an
/// exit code, printing warnings and errors along the way.
pub async fn run(cli: Cli) -> i32 {
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let cfg = match GlobalConfig::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("error[config]: {:#}", e);
            return 1;
        }
    };
    let admin_contact = cfg.admin_contact.clone();

    match execute(cli, cfg, &config_path).await {
        Ok(report) => {
            for warning in &report.warnings {
                eprintln!("warning: {}", warning);
            }
            0
        }
        Err(e) => {
            eprintln!("error[{}]: {}", e.error_code(), e);
            if let Some(contact) = admin_contact {
                eprintln!("if the problem persists, contact {}", contact);
            }
            e.exit_code()
        }
    }
}

async fn execute(cli: Cli, cfg: GlobalConfig, config_path: &std::path::Path) -> FleetResult<OpReport> {
    // Config management needs no orchestrator and must work even when the
    // database or supervisor are unreachable.
    if let Command::Config { action } = &cli.command {
        return match action {
            ConfigAction::Show => {
                let rendered = toml::to_string_pretty(&cfg)
                    .map_err(|e| FleetError::Internal(e.into()))?;
                print!("{}", rendered);
                Ok(OpReport::ok())
            }
            ConfigAction::Set { key, value } => {
                let mut cfg = cfg;
                cfg.set(key, value)
                    .map_err(|e| FleetError::Validation(e.to_string()))?;
                cfg.save(config_path).map_err(FleetError::Internal)?;
                println!("{} = {}", key, value);
                Ok(OpReport::ok())
            }
        };
    }

    let db = Arc::new(PostgresProvisioner::new(
        cfg.database.clone(),
        cfg.db_timeout_secs,
    ));
    let supervisor = Arc::new(Pm2Supervisor::new());
    let orchestrator = Orchestrator::new(cfg, db, supervisor);

    match cli.command {
        Command::List => {
            let summaries = orchestrator.list().await?;
            if summaries.is_empty() {
                println!("no instances");
                return Ok(OpReport::ok());
            }
            println!("{:<24} {:<10} {}", "SLUG", "STATUS", "NAME");
            for row in summaries {
                println!("{:<24} {:<10} {}", row.slug, row.status.to_string(), row.display_name);
                if let Some(detail) = row.detail {
                    println!("{:<24} {:<10} ({})", "", "", detail);
                }
            }
            Ok(OpReport::ok())
        }

        Command::Create { slug, name } => {
            let report = orchestrator.create(&slug, name.as_deref()).await?;
            println!("instance '{}' created and running", slug);
            Ok(report)
        }

        Command::Start { slug } => {
            let report = orchestrator.start(&slug).await?;
            println!("instance '{}' running", slug);
            Ok(report)
        }

        Command::Stop { slug } => {
            let report = orchestrator.stop(&slug).await?;
            println!("instance '{}' stopped", slug);
            Ok(report)
        }

        Command::Restart { slug } => {
            let report = orchestrator.restart(&slug).await?;
            println!("instance '{}' restarted", slug);
            Ok(report)
        }

        Command::Delete { slug, no_snapshot, yes } => {
            if no_snapshot && !yes {
                return Err(FleetError::Validation(
                    "refusing to delete without a snapshot; pass --yes to confirm".to_string(),
                ));
            }
            let report = orchestrator.delete(&slug, no_snapshot).await?;
            println!("instance '{}' deleted", slug);
            Ok(report)
        }

        Command::Backup { slug, all } => {
            if all {
                let report = orchestrator.backup_all().await?;
                println!("backed up all instances");
                Ok(report)
            } else {
                let slug = slug.ok_or_else(|| {
                    FleetError::Validation("provide an instance slug or --all".to_string())
                })?;
                let snapshot = orchestrator.backup(&slug).await?;
                println!("{}", snapshot.archive_path.display());
                Ok(OpReport::ok())
            }
        }

        Command::Restore { archive } => {
            let report = orchestrator.restore(&archive).await?;
            println!("restored from {}", archive.display());
            Ok(report)
        }

        Command::Update { slug, all } => {
            if all {
                let report = orchestrator.update_all().await?;
                println!("updated all instances");
                Ok(report)
            } else {
                let slug = slug.ok_or_else(|| {
                    FleetError::Validation("provide an instance slug or --all".to_string())
                })?;
                let report = orchestrator.update(&slug).await?;
                println!("instance '{}' updated", slug);
                Ok(report)
            }
        }

        Command::Sweep => {
            let removed = orchestrator.sweep_backups()?;
            println!("removed {} expired snapshot(s)", removed.len());
            Ok(OpReport::ok())
        }

        Command::Config { .. } => unreachable!("handled above"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_create_with_name() {
        let cli = Cli::try_parse_from(["botfleet", "create", "alpha", "--name", "Alpha Bot"]).unwrap();
        match cli.command {
            Command::Create { slug, name } => {
                assert_eq!(slug, "alpha");
                assert_eq!(name.as_deref(), Some("Alpha Bot"));
            }
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn parses_delete_flags() {
        let cli =
            Cli::try_parse_from(["botfleet", "delete", "alpha", "--no-snapshot", "--yes"]).unwrap();
        match cli.command {
            Command::Delete { slug, no_snapshot, yes } => {
                assert_eq!(slug, "alpha");
                assert!(no_snapshot);
                assert!(yes);
            }
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn backup_all_conflicts_with_slug() {
        assert!(Cli::try_parse_from(["botfleet", "backup", "alpha", "--all"]).is_err());
        assert!(Cli::try_parse_from(["botfleet", "backup", "--all"]).is_ok());
    }

    #[test]
    fn parses_global_config_flag() {
        let cli = Cli::try_parse_from(["botfleet", "--config", "/tmp/fleet.toml", "list"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/fleet.toml")));
    }

    #[test]
    fn parses_config_set() {
        let cli =
            Cli::try_parse_from(["botfleet", "config", "set", "database.port", "5433"]).unwrap();
        match cli.command {
            Command::Config { action: ConfigAction::Set { key, value } } => {
                assert_eq!(key, "database.port");
                assert_eq!(value, "5433");
            }
            _ => panic!("wrong command"),
        }
    }
}
