//! Filesystem exclusivity marker for migration and rotation.
//!
//! The lock file is created with `create_new` at the start of a destructive
//! operation and removed when the operation reaches a terminal state, so two
//! process instances cannot run one concurrently. A lock left behind by a
//! crashed instance is taken over once it is older than the staleness
//! window.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::KeeperError;

const STALE_AFTER_SECS: i64 = 60 * 60;

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    acquired_at: DateTime<Utc>,
}

pub struct MigrationLock {
    path: PathBuf,
    released: bool,
}

impl MigrationLock {
    /// Acquire the lock or fail with `LockContention` if another instance
    /// holds a fresh one.
    pub fn acquire(path: &Path) -> Result<Self, KeeperError> {
        match Self::try_create(path) {
            Ok(lock) => Ok(lock),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if is_stale(path) {
                    warn!(path = %path.display(), "taking over stale migration lock");
                    let _ = fs::remove_file(path);
                    Self::try_create(path).map_err(|_| KeeperError::LockContention)
                } else {
                    Err(KeeperError::LockContention)
                }
            }
            Err(e) => Err(KeeperError::Internal(format!("create lock file: {e}"))),
        }
    }

    fn try_create(path: &Path) -> io::Result<Self> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        let info = LockInfo {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        let json = serde_json::to_vec(&info).unwrap_or_default();
        file.write_all(&json)?;
        file.sync_all()?;
        Ok(Self {
            path: path.to_path_buf(),
            released: false,
        })
    }

    pub fn release(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if !self.released {
            if let Err(e) = fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e, "could not remove migration lock");
            }
            self.released = true;
        }
    }
}

impl Drop for MigrationLock {
    fn drop(&mut self) {
        self.remove();
    }
}

fn is_stale(path: &Path) -> bool {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        // already gone, racing remover won
        Err(_) => return true,
    };
    match serde_json::from_slice::<LockInfo>(&raw) {
        Ok(info) => (Utc::now() - info.acquired_at).num_seconds() > STALE_AFTER_SECS,
        // a lock file a crashed writer never finished
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    #[test]
    fn second_acquire_contends_until_release() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("migration.lock");
        let lock = MigrationLock::acquire(&path).unwrap();
        assert!(matches!(
            MigrationLock::acquire(&path),
            Err(KeeperError::LockContention)
        ));
        lock.release();
        let relock = MigrationLock::acquire(&path).unwrap();
        relock.release();
    }

    #[test]
    fn dropping_the_guard_releases_the_lock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("migration.lock");
        {
            let _lock = MigrationLock::acquire(&path).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn stale_lock_is_taken_over() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("migration.lock");
        let info = LockInfo {
            pid: 1,
            acquired_at: Utc::now() - Duration::hours(3),
        };
        fs::write(&path, serde_json::to_vec(&info).unwrap()).unwrap();

        let lock = MigrationLock::acquire(&path).unwrap();
        lock.release();
    }

    #[test]
    fn corrupt_lock_file_is_treated_as_stale() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("migration.lock");
        fs::write(&path, b"half-writ").unwrap();
        let lock = MigrationLock::acquire(&path).unwrap();
        lock.release();
    }
}
