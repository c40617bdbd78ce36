//! Backup/restore engine: immutable point-in-time snapshots of one instance.
//!
//! A snapshot is a single zip archive named `<slug>_<timestamp>.zip` so a
//! plain lexical sort orders snapshots by time without parsing the manifest.
//! Inside, entries live under a `<slug>_<timestamp>/` prefix: the manifest,
//! the database dump, and the instance's env/descriptor files. The archive
//! is self-contained; restoring depends on nothing outside it.
//!
//! The engine stops nothing itself -- whether the instance must be paused is
//! the caller's decision -- and has no time-based side effects: retention
//! sweeping is a separate, explicitly invoked operation.

use crate::db::DatabaseProvisioner;
use crate::error::{FleetError, FleetResult};
use crate::instance::envfile::EnvFile;
use crate::instance::{Instance, DESCRIPTOR_FILE, ENV_FILE};
use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Timestamp format embedded in archive names; lexically sortable.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

const MANIFEST_FILE: &str = "manifest.json";
const DUMP_FILE: &str = "database.sql";

/// Contents flags and integrity data for one snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub instance_slug: String,
    /// Same timestamp as in the archive name.
    pub created_at: String,
    pub has_database_dump: bool,
    pub has_env_file: bool,
    pub has_descriptor: bool,
    /// Hex SHA-256 of the dump, checked on restore.
    #[serde(default)]
    pub dump_sha256: Option<String>,
}

/// Handle to a completed snapshot archive.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub instance_slug: String,
    pub archive_path: PathBuf,
    pub manifest: Manifest,
}

pub struct BackupEngine {
    backups_root: PathBuf,
}

impl BackupEngine {
    pub fn new(backups_root: PathBuf) -> Self {
        Self { backups_root }
    }

    /// Capture an instance's database and config files into a new archive.
    pub async fn snapshot(
        &self,
        instance: &Instance,
        provisioner: &dyn DatabaseProvisioner,
    ) -> FleetResult<Snapshot> {
        std::fs::create_dir_all(&self.backups_root)
            .with_context(|| {
                format!("failed to create backups root {}", self.backups_root.display())
            })
            .map_err(FleetError::Internal)?;

        let dump = provisioner.dump(&instance.database_name).await?;
        let env_bytes = read_optional(&instance.env_path()).map_err(FleetError::Internal)?;
        let descriptor_bytes =
            read_optional(&instance.descriptor_path()).map_err(FleetError::Internal)?;

        let timestamp = Utc::now().format(TIMESTAMP_FORMAT).to_string();
        let stem = format!("{}_{}", instance.slug, timestamp);
        let manifest = Manifest {
            instance_slug: instance.slug.clone(),
            created_at: timestamp,
            has_database_dump: true,
            has_env_file: env_bytes.is_some(),
            has_descriptor: descriptor_bytes.is_some(),
            dump_sha256: Some(hex::encode(Sha256::digest(&dump))),
        };

        // Write to a temp name first; the sweep and listings only consider
        // completed `.zip` files, so a partial archive is never visible.
        let final_path = self.backups_root.join(format!("{}.zip", stem));
        let tmp_path = self.backups_root.join(format!(".{}.zip.tmp", stem));
        write_archive(&tmp_path, &stem, &manifest, &dump, &env_bytes, &descriptor_bytes)
            .map_err(FleetError::Internal)?;
        std::fs::rename(&tmp_path, &final_path)
            .with_context(|| format!("failed to finalize archive {}", final_path.display()))
            .map_err(FleetError::Internal)?;

        tracing::info!(
            "Snapshot of '{}' written to {}",
            instance.slug,
            final_path.display()
        );
        Ok(Snapshot {
            instance_slug: instance.slug.clone(),
            archive_path: final_path,
            manifest,
        })
    }

    /// Read the manifest and archived env file without restoring anything.
    /// The restore-into-new-instance flow needs the archived credentials to
    /// provision the target database first.
    pub fn peek(&self, archive: &Path) -> FleetResult<(Manifest, Option<EnvFile>)> {
        let mut zip = open_archive(archive).map_err(FleetError::Internal)?;
        let manifest = read_manifest(&mut zip).map_err(FleetError::Internal)?;
        let env = read_entry(&mut zip, &manifest, ENV_FILE)
            .map_err(FleetError::Internal)?
            .map(|bytes| EnvFile::parse(&String::from_utf8_lossy(&bytes)));
        Ok((manifest, env))
    }

    /// Restore a snapshot into the target instance: validate the manifest
    /// against what is present, restore the database dump, and overwrite the
    /// target's env/descriptor files with the archived copies.
    ///
    /// Destructive for the target database; callers take their own snapshot
    /// first when current data matters.
    pub async fn restore(
        &self,
        archive: &Path,
        target: &Instance,
        provisioner: &dyn DatabaseProvisioner,
    ) -> FleetResult<()> {
        let mut zip = open_archive(archive).map_err(FleetError::Internal)?;
        let manifest = read_manifest(&mut zip).map_err(FleetError::Internal)?;

        if manifest.has_database_dump {
            let dump = read_entry(&mut zip, &manifest, DUMP_FILE)
                .map_err(FleetError::Internal)?
                .ok_or_else(|| {
                    FleetError::Internal(anyhow!(
                        "manifest declares a database dump but {} is missing from the archive",
                        DUMP_FILE
                    ))
                })?;
            if let Some(expected) = &manifest.dump_sha256 {
                let actual = hex::encode(Sha256::digest(&dump));
                if &actual != expected {
                    return Err(FleetError::Internal(anyhow!(
                        "dump checksum mismatch: expected {}, got {}",
                        expected,
                        actual
                    )));
                }
            }
            provisioner.restore(&target.database_name, &dump).await?;
        }

        std::fs::create_dir_all(&target.directory)
            .with_context(|| {
                format!("failed to create instance directory {}", target.directory.display())
            })
            .map_err(FleetError::Internal)?;
        if manifest.has_env_file {
            if let Some(bytes) = read_entry(&mut zip, &manifest, ENV_FILE).map_err(FleetError::Internal)? {
                std::fs::write(target.env_path(), bytes).map_err(|e| FleetError::Internal(e.into()))?;
            }
        }
        if manifest.has_descriptor {
            if let Some(bytes) =
                read_entry(&mut zip, &manifest, DESCRIPTOR_FILE).map_err(FleetError::Internal)?
            {
                std::fs::write(target.descriptor_path(), bytes)
                    .map_err(|e| FleetError::Internal(e.into()))?;
            }
        }

        tracing::info!(
            "Restored snapshot {} into instance '{}'",
            archive.display(),
            target.slug
        );
        Ok(())
    }

    /// Completed archives for one slug (or all), lexically sorted, which for
    /// this naming scheme is chronological order.
    pub fn list_archives(&self, slug: Option<&str>) -> FleetResult<Vec<PathBuf>> {
        let mut archives = Vec::new();
        if !self.backups_root.exists() {
            return Ok(archives);
        }
        for entry in std::fs::read_dir(&self.backups_root)
            .with_context(|| format!("failed to read backups root {}", self.backups_root.display()))
            .map_err(FleetError::Internal)?
        {
            let entry = entry.map_err(|e| FleetError::Internal(e.into()))?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(".zip") {
                continue;
            }
            if let Some(slug) = slug {
                if parse_archive_name(name).map(|(s, _)| s) != Some(slug.to_string()) {
                    continue;
                }
            }
            archives.push(path);
        }
        archives.sort();
        Ok(archives)
    }

    /// Most recent archive for a slug.
    pub fn latest_for(&self, slug: &str) -> FleetResult<Option<PathBuf>> {
        Ok(self.list_archives(Some(slug))?.pop())
    }

    /// Delete archives older than the retention window. Returns the removed
    /// paths. Archives whose name does not parse are left alone.
    pub fn sweep(&self, retention_days: u32) -> FleetResult<Vec<PathBuf>> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
        let mut removed = Vec::new();
        for path in self.list_archives(None)? {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some((_, timestamp)) = parse_archive_name(name) else {
                tracing::debug!("Skipping unrecognized archive name {}", name);
                continue;
            };
            if timestamp < cutoff {
                std::fs::remove_file(&path)
                    .with_context(|| format!("failed to remove {}", path.display()))
                    .map_err(FleetError::Internal)?;
                tracing::info!("Swept expired snapshot {}", path.display());
                removed.push(path);
            }
        }
        Ok(removed)
    }
}

/// Split `<slug>_<timestamp>.zip` into slug and parsed timestamp.
pub fn parse_archive_name(name: &str) -> Option<(String, chrono::DateTime<Utc>)> {
    let stem = name.strip_suffix(".zip")?;
    let (slug, ts) = stem.rsplit_once('_')?;
    let naive = NaiveDateTime::parse_from_str(ts, TIMESTAMP_FORMAT).ok()?;
    Some((slug.to_string(), Utc.from_utc_datetime(&naive)))
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    if path.exists() {
        Ok(Some(std::fs::read(path)?))
    } else {
        Ok(None)
    }
}

fn write_archive(
    path: &Path,
    stem: &str,
    manifest: &Manifest,
    dump: &[u8],
    env: &Option<Vec<u8>>,
    descriptor: &Option<Vec<u8>>,
) -> Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("failed to create archive {}", path.display()))?;
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    writer.start_file(format!("{}/{}", stem, MANIFEST_FILE), options)?;
    writer.write_all(serde_json::to_string_pretty(manifest)?.as_bytes())?;

    writer.start_file(format!("{}/{}", stem, DUMP_FILE), options)?;
    writer.write_all(dump)?;

    if let Some(bytes) = env {
        writer.start_file(format!("{}/{}", stem, ENV_FILE), options)?;
        writer.write_all(bytes)?;
    }
    if let Some(bytes) = descriptor {
        writer.start_file(format!("{}/{}", stem, DESCRIPTOR_FILE), options)?;
        writer.write_all(bytes)?;
    }
    writer.finish()?;
    Ok(())
}

fn open_archive(path: &Path) -> Result<zip::ZipArchive<std::fs::File>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open archive {}", path.display()))?;
    zip::ZipArchive::new(file).with_context(|| format!("{} is not a zip archive", path.display()))
}

fn read_manifest(zip: &mut zip::ZipArchive<std::fs::File>) -> Result<Manifest> {
    // The manifest lives under the <slug>_<timestamp>/ prefix; scan for it
    // so the archive stays restorable after a rename.
    let name = (0..zip.len())
        .filter_map(|i| zip.by_index(i).ok().map(|f| f.name().to_string()))
        .find(|n| n.ends_with(MANIFEST_FILE))
        .ok_or_else(|| anyhow!("archive has no {}", MANIFEST_FILE))?;
    let mut entry = zip.by_name(&name)?;
    let mut content = String::new();
    entry.read_to_string(&mut content)?;
    serde_json::from_str(&content).context("unparsable manifest")
}

fn read_entry(
    zip: &mut zip::ZipArchive<std::fs::File>,
    manifest: &Manifest,
    file: &str,
) -> Result<Option<Vec<u8>>> {
    let name = format!("{}_{}/{}", manifest.instance_slug, manifest.created_at, file);
    match zip.by_name(&name) {
        Ok(mut entry) => {
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes)?;
            Ok(Some(bytes))
        }
        Err(zip::result::ZipError::FileNotFound) => Ok(None),
        Err(e) => Err(e.into()),
    }
}
