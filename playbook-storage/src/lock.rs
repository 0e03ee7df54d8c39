//! Advisory file lock guarding the playbook's read-modify-write cycles.
//!
//! The lock file is a sibling of the playbook (`<file>.lock`) and is
//! never deleted; correctness comes from the OS advisory lock, which is
//! released automatically if the holder dies. Prompt-time loads take the
//! shared mode, reflections take the exclusive mode.

use playbook_core::{Deadline, StorageError};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How long to wait between contended acquisition attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Lock mode determining concurrency behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Multiple holders; used for plain loads.
    Shared,
    /// Single holder; required for any read-modify-write sequence.
    Exclusive,
}

/// A held lock; released on drop.
#[derive(Debug)]
pub struct PlaybookLock {
    file: File,
    path: PathBuf,
    mode: LockMode,
}

/// The lock file path for a playbook path.
pub fn lock_path_for(playbook_path: &Path) -> PathBuf {
    let mut name = playbook_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "playbook.json".into());
    name.push(".lock");
    playbook_path.with_file_name(name)
}

impl PlaybookLock {
    /// Acquire the lock, polling until the deadline runs out.
    pub fn acquire(
        playbook_path: &Path,
        mode: LockMode,
        deadline: Deadline,
    ) -> Result<Self, StorageError> {
        let path = lock_path_for(playbook_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Io {
                operation: "create lock directory".to_string(),
                reason: e.to_string(),
            })?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StorageError::Io {
                operation: "open lock file".to_string(),
                reason: e.to_string(),
            })?;

        loop {
            let attempt = match mode {
                LockMode::Shared => fs2::FileExt::try_lock_shared(&file),
                LockMode::Exclusive => fs2::FileExt::try_lock_exclusive(&file),
            };
            match attempt {
                Ok(()) => {
                    return Ok(Self {
                        file,
                        path,
                        mode,
                    })
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if deadline.is_expired() {
                        return Err(StorageError::LockFailed {
                            path: path.display().to_string(),
                            reason: "deadline expired while waiting for the holder".to_string(),
                        });
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => {
                    return Err(StorageError::LockFailed {
                        path: path.display().to_string(),
                        reason: e.to_string(),
                    })
                }
            }
        }
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PlaybookLock {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "lock release failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn short_deadline() -> Deadline {
        Deadline::after(Duration::from_millis(200))
    }

    #[test]
    fn test_lock_path_is_sibling() {
        let path = lock_path_for(Path::new("/tmp/project/.claude/playbook.json"));
        assert_eq!(path, Path::new("/tmp/project/.claude/playbook.json.lock"));
    }

    #[test]
    fn test_exclusive_lock_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let playbook = dir.path().join("playbook.json");
        let lock = PlaybookLock::acquire(&playbook, LockMode::Exclusive, short_deadline()).unwrap();
        assert_eq!(lock.mode(), LockMode::Exclusive);
        drop(lock);
        // Re-acquirable after release.
        PlaybookLock::acquire(&playbook, LockMode::Exclusive, short_deadline()).unwrap();
    }

    #[test]
    fn test_shared_locks_coexist() {
        let dir = tempfile::tempdir().unwrap();
        let playbook = dir.path().join("playbook.json");
        let _a = PlaybookLock::acquire(&playbook, LockMode::Shared, short_deadline()).unwrap();
        let _b = PlaybookLock::acquire(&playbook, LockMode::Shared, short_deadline()).unwrap();
    }
}
