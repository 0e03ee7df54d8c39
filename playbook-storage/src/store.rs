//! Atomic load/store of the playbook file.
//!
//! Writes go to a temporary sibling, get fsynced, then rename over the
//! live file; the previous content survives as a timestamped backup.
//! Readers therefore see either the old document or the new one, never
//! a torn write.

use chrono::Utc;
use playbook_core::{Playbook, PlaybookResult, StorageError, ValidationLimits};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

const BACKUP_SUFFIX: &str = ".bak";

/// Identity of the on-disk playbook at a point in time. Compared before
/// replaying a reflection that ran outside the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub mtime: Option<SystemTime>,
    pub sha256: [u8; 32],
}

/// Raw bytes captured before a risky multi-step mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// `None` when the playbook file did not exist.
    bytes: Option<Vec<u8>>,
}

/// Handle to one playbook file and its sibling backups.
#[derive(Debug, Clone)]
pub struct PlaybookStore {
    path: PathBuf,
    backup_keep: usize,
    limits: ValidationLimits,
}

impl PlaybookStore {
    pub fn new(path: impl Into<PathBuf>, backup_keep: usize, limits: ValidationLimits) -> Self {
        Self {
            path: path.into(),
            backup_keep,
            limits,
        }
    }

    pub fn from_config(config: &playbook_core::PlaybookConfig) -> Self {
        Self::new(&config.playbook_path, config.backup_keep, config.limits())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the playbook. A missing file is an empty playbook; a corrupt
    /// file falls back to the newest readable backup.
    pub fn load(&self) -> PlaybookResult<Playbook> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Playbook::empty()),
            Err(e) => {
                return Err(StorageError::Io {
                    operation: "read playbook".to_string(),
                    reason: e.to_string(),
                }
                .into())
            }
        };

        match serde_json::from_slice::<Playbook>(&bytes) {
            Ok(playbook) => Ok(playbook),
            Err(parse_err) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %parse_err,
                    "playbook unreadable, trying backups"
                );
                for backup in self.backups()? {
                    if let Ok(bytes) = fs::read(&backup) {
                        if let Ok(playbook) = serde_json::from_slice::<Playbook>(&bytes) {
                            tracing::warn!(backup = %backup.display(), "recovered from backup");
                            return Ok(playbook);
                        }
                    }
                }
                Err(StorageError::CorruptPlaybook {
                    path: self.path.display().to_string(),
                    reason: parse_err.to_string(),
                }
                .into())
            }
        }
    }

    /// Validate and persist atomically. On any failure the live file is
    /// untouched; on success the previous content becomes a backup.
    pub fn store(&self, playbook: &mut Playbook) -> PlaybookResult<()> {
        playbook.clamp_attributes();
        playbook.validate(&self.limits)?;

        let json = serde_json::to_vec_pretty(playbook).map_err(|e| StorageError::Io {
            operation: "encode playbook".to_string(),
            reason: e.to_string(),
        })?;

        let dir = self.parent_dir();
        fs::create_dir_all(&dir).map_err(|e| StorageError::Io {
            operation: "create playbook directory".to_string(),
            reason: e.to_string(),
        })?;

        // Retain the previous content before renaming over it.
        if self.path.exists() {
            let backup = self.backup_path();
            if let Err(e) = fs::copy(&self.path, &backup) {
                tracing::warn!(backup = %backup.display(), error = %e, "backup copy failed");
            }
        }

        let tmp = dir.join(format!(
            ".{}.tmp.{}",
            self.file_name(),
            std::process::id()
        ));
        let write = (|| -> std::io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
            Ok(())
        })();
        if let Err(e) = write {
            let _ = fs::remove_file(&tmp);
            return Err(StorageError::Io {
                operation: "write playbook temp file".to_string(),
                reason: e.to_string(),
            }
            .into());
        }

        if let Err(e) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(StorageError::Io {
                operation: "rename playbook into place".to_string(),
                reason: e.to_string(),
            }
            .into());
        }

        // Make the rename durable; failure here is not a torn write.
        if let Ok(dir_handle) = File::open(&dir) {
            let _ = dir_handle.sync_all();
        }

        self.prune_backups();
        Ok(())
    }

    /// Capture the raw file content for a later [`restore`].
    ///
    /// [`restore`]: PlaybookStore::restore
    pub fn snapshot(&self) -> PlaybookResult<Snapshot> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Snapshot { bytes: Some(bytes) }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Snapshot { bytes: None }),
            Err(e) => Err(StorageError::Io {
                operation: "snapshot playbook".to_string(),
                reason: e.to_string(),
            }
            .into()),
        }
    }

    /// Put the file back exactly as it was at [`snapshot`] time.
    ///
    /// [`snapshot`]: PlaybookStore::snapshot
    pub fn restore(&self, snapshot: &Snapshot) -> PlaybookResult<()> {
        match &snapshot.bytes {
            None => match fs::remove_file(&self.path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(StorageError::Io {
                    operation: "remove playbook during restore".to_string(),
                    reason: e.to_string(),
                }
                .into()),
            },
            Some(bytes) => {
                let tmp = self
                    .parent_dir()
                    .join(format!(".{}.restore.{}", self.file_name(), std::process::id()));
                let write = (|| -> std::io::Result<()> {
                    let mut file = File::create(&tmp)?;
                    file.write_all(bytes)?;
                    file.sync_all()?;
                    fs::rename(&tmp, &self.path)
                })();
                write.map_err(|e| {
                    let _ = fs::remove_file(&tmp);
                    StorageError::Io {
                        operation: "restore playbook".to_string(),
                        reason: e.to_string(),
                    }
                    .into()
                })
            }
        }
    }

    /// Identity of the current file, or `None` when absent.
    pub fn fingerprint(&self) -> PlaybookResult<Option<Fingerprint>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StorageError::Io {
                    operation: "fingerprint playbook".to_string(),
                    reason: e.to_string(),
                }
                .into())
            }
        };
        let mtime = fs::metadata(&self.path).ok().and_then(|m| m.modified().ok());
        Ok(Some(Fingerprint {
            mtime,
            sha256: Sha256::digest(&bytes).into(),
        }))
    }

    fn parent_dir(&self) -> PathBuf {
        self.path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "playbook.json".to_string())
    }

    fn backup_path(&self) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3f");
        self.parent_dir()
            .join(format!("{}.{}{}", self.file_name(), stamp, BACKUP_SUFFIX))
    }

    /// Existing backups, newest first.
    fn backups(&self) -> PlaybookResult<Vec<PathBuf>> {
        let prefix = format!("{}.", self.file_name());
        let mut backups = Vec::new();
        let entries = match fs::read_dir(self.parent_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(backups),
            Err(e) => {
                return Err(StorageError::Io {
                    operation: "list backups".to_string(),
                    reason: e.to_string(),
                }
                .into())
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(&prefix) && name.ends_with(BACKUP_SUFFIX) {
                backups.push(entry.path());
            }
        }
        // Timestamps sort lexicographically; newest first.
        backups.sort();
        backups.reverse();
        Ok(backups)
    }

    fn prune_backups(&self) {
        let Ok(backups) = self.backups() else {
            return;
        };
        for stale in backups.iter().skip(self.backup_keep) {
            if let Err(e) = fs::remove_file(stale) {
                tracing::warn!(backup = %stale.display(), error = %e, "backup GC failed");
            }
        }
    }
}
