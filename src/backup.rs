//! Save-data backups.
//!
//! Archives hold the instance's `ShooterGame/Saved` directory under a single
//! top-level `Saved/` entry and live in the instance's backups directory.
//! Archive and extraction work runs on the blocking pool.

use chrono::{DateTime, Local, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tar::{Archive, Builder};
use tokio::task::spawn_blocking;
use tracing::{debug, info, warn};

use crate::env;
use crate::error::{FleetError, Result};
use crate::lifecycle::ContainerLifecycleManager;
use crate::model::{InstanceId, ObservedState, Operation};

const ARCHIVE_ROOT: &str = "Saved";
const ARCHIVE_PREFIX: &str = "backup_";
const SAFETY_PREFIX: &str = "safety_";
const ARCHIVE_SUFFIX: &str = ".tar.gz";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupInfo {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

pub struct BackupManager {
    lifecycle: Arc<ContainerLifecycleManager>,
    data_root: PathBuf,
    keep: usize,
}

impl BackupManager {
    pub fn new(lifecycle: Arc<ContainerLifecycleManager>, data_root: PathBuf, keep: usize) -> Self {
        Self {
            lifecycle,
            data_root,
            keep,
        }
    }

    fn saved_dir(&self, id: InstanceId) -> PathBuf {
        env::instance_server_dir_path(&self.data_root, &id.to_string())
            .join(env::SAVED_DIR_RELATIVE)
    }

    fn backups_dir(&self, id: InstanceId) -> PathBuf {
        env::instance_backups_dir_path(&self.data_root, &id.to_string())
    }

    async fn ensure_instance(&self, id: InstanceId) -> Result<()> {
        self.lifecycle
            .store()
            .get_instance(id)
            .await?
            .map(|_| ())
            .ok_or(FleetError::InstanceNotFound(id))
    }

    /// Archive the instance's save data. Works while the server runs.
    pub async fn create(&self, id: InstanceId) -> Result<BackupInfo> {
        self.ensure_instance(id).await?;
        let saved = self.saved_dir(id);
        let dir = self.backups_dir(id);
        let name = archive_name(ARCHIVE_PREFIX);

        let info = spawn_blocking(move || write_archive(&saved, &dir, &name))
            .await
            .map_err(|e| FleetError::Backup(format!("backup task failed: {}", e)))??;
        info!(
            "Created backup {} of instance {} ({} bytes)",
            info.name, id, info.size_bytes
        );
        Ok(info)
    }

    /// Backups of the instance, newest first.
    pub async fn list(&self, id: InstanceId) -> Result<Vec<BackupInfo>> {
        let dir = self.backups_dir(id);
        spawn_blocking(move || list_archives(&dir))
            .await
            .map_err(|e| FleetError::Backup(format!("list task failed: {}", e)))?
    }

    /// Delete all but the newest `backup.keep` backups. Returns the removed ones.
    pub async fn prune(&self, id: InstanceId) -> Result<Vec<BackupInfo>> {
        let backups = self.list(id).await?;
        let mut removed = Vec::new();
        for backup in backups.into_iter().skip(self.keep) {
            match tokio::fs::remove_file(&backup.path).await {
                Ok(()) => {
                    debug!("Pruned backup {}", backup.path.display());
                    removed.push(backup);
                }
                Err(e) => warn!("Could not prune {}: {}", backup.path.display(), e),
            }
        }
        if !removed.is_empty() {
            info!("Pruned {} backups of instance {}", removed.len(), id);
        }
        Ok(removed)
    }

    /// Replace the save data with the contents of backup `name`.
    ///
    /// The instance must be stopped; it is held busy for the duration, and a
    /// safety archive of the current save data is taken first.
    pub async fn restore(&self, id: InstanceId, name: &str) -> Result<BackupInfo> {
        if name.contains('/') || name.contains("..") || !name.ends_with(ARCHIVE_SUFFIX) {
            return Err(FleetError::Backup(format!("invalid backup name: {}", name)));
        }
        let archive = self.backups_dir(id).join(name);
        let saved = self.saved_dir(id);
        let dir = self.backups_dir(id);

        self.lifecycle
            .run_marked(id, Operation::Restore, |instance| async move {
                if instance.observed != ObservedState::Stopped {
                    return Err(FleetError::InvalidState {
                        id,
                        operation: Operation::Restore,
                        state: instance.observed,
                    });
                }
                if !archive.is_file() {
                    return Err(FleetError::Backup(format!("backup not found: {}", name)));
                }

                let info = spawn_blocking(move || -> Result<BackupInfo> {
                    if saved.is_dir() {
                        let safety = write_archive(&saved, &dir, &archive_name(SAFETY_PREFIX))?;
                        debug!("Safety backup {}", safety.path.display());
                    }
                    extract_archive(&archive, &saved)?;
                    describe(&archive)
                })
                .await
                .map_err(|e| FleetError::Backup(format!("restore task failed: {}", e)))??;

                info!("Restored backup {} into instance {}", info.name, id);
                Ok(info)
            })
            .await
    }
}

fn archive_name(prefix: &str) -> String {
    format!(
        "{}{}{}",
        prefix,
        Local::now().format("%Y%m%d_%H%M%S"),
        ARCHIVE_SUFFIX
    )
}

fn write_archive(saved: &Path, dir: &Path, name: &str) -> Result<BackupInfo> {
    if !saved.is_dir() {
        return Err(FleetError::Backup(format!(
            "no save data at {}",
            saved.display()
        )));
    }
    fs::create_dir_all(dir)?;

    let path = unique_path(dir, name);
    let file = File::create(&path)?;
    let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));
    builder.append_dir_all(ARCHIVE_ROOT, saved)?;
    builder.into_inner()?.finish()?;
    describe(&path)
}

/// Two backups in the same second get distinct names.
fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let stem = name.trim_end_matches(ARCHIVE_SUFFIX);
    (1..)
        .map(|n| dir.join(format!("{}_{}{}", stem, n, ARCHIVE_SUFFIX)))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

fn describe(path: &Path) -> Result<BackupInfo> {
    let meta = fs::metadata(path)?;
    let created_at = meta
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    Ok(BackupInfo {
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        path: path.to_path_buf(),
        size_bytes: meta.len(),
        created_at,
    })
}

fn list_archives(dir: &Path) -> Result<Vec<BackupInfo>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut backups = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_backup = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(ARCHIVE_PREFIX) && n.ends_with(ARCHIVE_SUFFIX));
        if is_backup && path.is_file() {
            backups.push(describe(&path)?);
        }
    }
    // Names embed the timestamp, so they break ties within one mtime second.
    backups.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.name.cmp(&a.name))
    });
    Ok(backups)
}

fn extract_archive(archive: &Path, saved: &Path) -> Result<()> {
    let parent = saved
        .parent()
        .ok_or_else(|| FleetError::Backup(format!("no parent for {}", saved.display())))?;
    fs::create_dir_all(parent)?;

    let staging = parent.join(".restore-staging");
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }
    fs::create_dir_all(&staging)?;

    let mut tar = Archive::new(GzDecoder::new(File::open(archive)?));
    tar.unpack(&staging)?;

    let extracted = staging.join(ARCHIVE_ROOT);
    let source = if extracted.is_dir() {
        extracted
    } else {
        staging.clone()
    };

    if saved.exists() {
        fs::remove_dir_all(saved)?;
    }
    fs::rename(&source, saved)?;
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seed(saved: &Path, content: &str) {
        fs::create_dir_all(saved.join("SavedArks")).unwrap();
        fs::write(saved.join("SavedArks/TheIsland.ark"), content).unwrap();
    }

    #[test]
    fn test_archive_round_trip() {
        let temp = TempDir::new().unwrap();
        let saved = temp.path().join("server/ShooterGame/Saved");
        let backups = temp.path().join("backups");
        seed(&saved, "day 1");

        let info = write_archive(&saved, &backups, "backup_20250101_000000.tar.gz").unwrap();
        assert!(info.size_bytes > 0);

        fs::write(saved.join("SavedArks/TheIsland.ark"), "day 2").unwrap();
        fs::write(saved.join("stray.txt"), "x").unwrap();
        extract_archive(&info.path, &saved).unwrap();

        assert_eq!(
            fs::read_to_string(saved.join("SavedArks/TheIsland.ark")).unwrap(),
            "day 1"
        );
        assert!(!saved.join("stray.txt").exists());
        assert!(!saved.parent().unwrap().join(".restore-staging").exists());
    }

    #[test]
    fn test_missing_save_data() {
        let temp = TempDir::new().unwrap();
        let result = write_archive(&temp.path().join("nope"), temp.path(), "b.tar.gz");
        assert!(matches!(result, Err(FleetError::Backup(_))));
    }

    #[test]
    fn test_list_filters_and_orders() {
        let temp = TempDir::new().unwrap();
        let saved = temp.path().join("Saved");
        seed(&saved, "data");
        let dir = temp.path().join("backups");

        write_archive(&saved, &dir, "backup_20250101_000000.tar.gz").unwrap();
        write_archive(&saved, &dir, "backup_20250102_000000.tar.gz").unwrap();
        write_archive(&saved, &dir, "safety_20250103_000000.tar.gz").unwrap();
        fs::write(dir.join("notes.txt"), "ignore me").unwrap();

        let names: Vec<String> = list_archives(&dir)
            .unwrap()
            .into_iter()
            .map(|b| b.name)
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.iter().all(|n| n.starts_with(ARCHIVE_PREFIX)));
    }

    #[test]
    fn test_unique_path_avoids_collision() {
        let temp = TempDir::new().unwrap();
        let name = "backup_20250101_000000.tar.gz";
        fs::write(temp.path().join(name), "").unwrap();
        let path = unique_path(temp.path(), name);
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "backup_20250101_000000_1.tar.gz"
        );
    }

    #[test]
    fn test_list_missing_dir_is_empty() {
        let temp = TempDir::new().unwrap();
        assert!(list_archives(&temp.path().join("none")).unwrap().is_empty());
    }
}
