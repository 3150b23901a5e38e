//! Timestamped, integrity-checked snapshots of the storage files.
//!
//! Snapshots are copied into staging first, size-verified against the
//! source, fsynced and promoted with a rename, so a crash mid-copy never
//! leaves a half-written snapshot that looks complete. Each snapshot carries
//! a manifest (source path, size, BLAKE3 checksum, timestamp, label) written
//! the same way. Restores verify the manifest before touching the live path
//! and go through a sibling temp file, so a failed restore leaves the
//! pre-restore state intact.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

use keeper_crypto::hash::content_hex;

use crate::error::KeeperError;
use crate::fsutil;

const SNAPSHOT_SUFFIX: &str = ".db";
const MANIFEST_SUFFIX: &str = ".manifest.json";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    pub source_path: String,
    pub size: u64,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
    pub label: String,
}

/// Reference to a complete, size-verified snapshot. Valid until pruned.
#[derive(Debug, Clone)]
pub struct BackupHandle {
    pub path: PathBuf,
    pub manifest_path: PathBuf,
    pub manifest: BackupManifest,
}

/// Retention policy for [`BackupManager::prune`]. Both limits are optional
/// and combine: a snapshot is removed when it falls outside either one.
#[derive(Debug, Clone, Default)]
pub struct PrunePolicy {
    pub keep_last: Option<usize>,
    pub max_age: Option<Duration>,
}

pub struct BackupManager {
    backups_dir: PathBuf,
    staging_dir: PathBuf,
}

impl BackupManager {
    pub fn open(backups_dir: impl AsRef<Path>) -> Result<Self, KeeperError> {
        let backups_dir = backups_dir.as_ref().to_path_buf();
        let staging_dir = backups_dir.join("staging");
        fs::create_dir_all(&staging_dir)
            .map_err(|e| KeeperError::BackupFailed(format!("create backups dir: {e}")))?;
        restrict_dir_permissions(&backups_dir);
        cleanup_staging_dir(&staging_dir);
        Ok(Self {
            backups_dir,
            staging_dir,
        })
    }

    /// Snapshot `source` under `label`. The copy is verified against the
    /// source size before it is renamed into place.
    pub fn snapshot(&self, source: &Path, label: &str) -> Result<BackupHandle, KeeperError> {
        let mut file = File::open(source)
            .map_err(|e| KeeperError::BackupFailed(format!("open {}: {e}", source.display())))?;
        let expected_size = file
            .metadata()
            .map_err(|e| KeeperError::BackupFailed(format!("stat source: {e}")))?
            .len();
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .map_err(|e| KeeperError::BackupFailed(format!("read source: {e}")))?;
        if data.len() as u64 != expected_size {
            return Err(KeeperError::BackupFailed(
                "source changed while being copied".into(),
            ));
        }
        let checksum = content_hex(&data);

        let staging = self.staging_dir.join(format!("{}.staging", Uuid::new_v4()));
        {
            let mut out = File::create(&staging)
                .map_err(|e| KeeperError::BackupFailed(format!("create staging file: {e}")))?;
            out.write_all(&data)
                .and_then(|_| out.sync_all())
                .map_err(|e| KeeperError::BackupFailed(format!("write staging file: {e}")))?;
        }

        let created_at = Utc::now();
        let (path, manifest_path) = self.allocate_names(created_at, label);
        fs::rename(&staging, &path).map_err(|e| {
            let _ = fs::remove_file(&staging);
            KeeperError::BackupFailed(format!("promote snapshot: {e}"))
        })?;
        let _ = fsutil::fsync_dir(&self.backups_dir);

        let manifest = BackupManifest {
            source_path: source.to_string_lossy().into_owned(),
            size: expected_size,
            checksum,
            created_at,
            label: label.to_string(),
        };
        let manifest_json = serde_json::to_vec_pretty(&manifest)?;
        fsutil::write_atomic(&manifest_path, &manifest_json)
            .map_err(|e| KeeperError::BackupFailed(format!("write manifest: {e}")))?;

        Ok(BackupHandle {
            path,
            manifest_path,
            manifest,
        })
    }

    /// Restore a snapshot over the live path recorded in its manifest.
    pub fn restore(&self, handle: &BackupHandle) -> Result<(), KeeperError> {
        let target = PathBuf::from(&handle.manifest.source_path);
        self.restore_to(handle, &target)
    }

    /// Restore a snapshot to an explicit target path. The snapshot is
    /// re-verified against its manifest first.
    pub fn restore_to(&self, handle: &BackupHandle, target: &Path) -> Result<(), KeeperError> {
        let data = fs::read(&handle.path)
            .map_err(|e| KeeperError::BackupFailed(format!("read snapshot: {e}")))?;
        if data.len() as u64 != handle.manifest.size {
            return Err(KeeperError::BackupFailed(format!(
                "snapshot size mismatch: expected {}, got {}",
                handle.manifest.size,
                data.len()
            )));
        }
        let actual = content_hex(&data);
        if actual != handle.manifest.checksum {
            return Err(KeeperError::BackupFailed(format!(
                "snapshot checksum mismatch: expected {}, got {actual}",
                handle.manifest.checksum
            )));
        }
        fsutil::write_atomic(target, &data)
            .map_err(|e| KeeperError::BackupFailed(format!("write restore target: {e}")))
    }

    /// Enumerate snapshots newest-first. Snapshots with a missing data file
    /// or an unreadable manifest are skipped with a warning.
    pub fn list(&self) -> Result<Vec<BackupHandle>, KeeperError> {
        let mut handles = Vec::new();
        let entries = fs::read_dir(&self.backups_dir)
            .map_err(|e| KeeperError::BackupFailed(format!("read backups dir: {e}")))?;
        for entry in entries.flatten() {
            let manifest_path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(stem) = name.strip_suffix(MANIFEST_SUFFIX) else {
                continue;
            };
            let manifest: BackupManifest = match fs::read(&manifest_path)
                .map_err(KeeperError::from)
                .and_then(|raw| serde_json::from_slice(&raw).map_err(KeeperError::from))
            {
                Ok(m) => m,
                Err(e) => {
                    warn!(path = %manifest_path.display(), error = %e, "skipping unreadable backup manifest");
                    continue;
                }
            };
            let path = self.backups_dir.join(format!("{stem}{SNAPSHOT_SUFFIX}"));
            if !path.exists() {
                warn!(path = %path.display(), "skipping manifest without snapshot file");
                continue;
            }
            handles.push(BackupHandle {
                path,
                manifest_path,
                manifest,
            });
        }
        handles.sort_by(|a, b| {
            b.manifest
                .created_at
                .cmp(&a.manifest.created_at)
                .then_with(|| b.path.cmp(&a.path))
        });
        Ok(handles)
    }

    /// Newest snapshot carrying `label`, if any.
    pub fn latest(&self, label: &str) -> Result<Option<BackupHandle>, KeeperError> {
        Ok(self.list()?.into_iter().find(|h| h.manifest.label == label))
    }

    /// Remove snapshots beyond the count cap or older than the age limit.
    /// Returns how many were removed.
    pub fn prune(&self, policy: &PrunePolicy) -> Result<usize, KeeperError> {
        let handles = self.list()?;
        let now = Utc::now();
        let mut removed = 0;
        for (index, handle) in handles.iter().enumerate() {
            let beyond_cap = policy.keep_last.is_some_and(|cap| index >= cap);
            let too_old = policy
                .max_age
                .is_some_and(|age| now - handle.manifest.created_at > age);
            if beyond_cap || too_old {
                let _ = fs::remove_file(&handle.path);
                let _ = fs::remove_file(&handle.manifest_path);
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn allocate_names(&self, created_at: DateTime<Utc>, label: &str) -> (PathBuf, PathBuf) {
        let ts = created_at.format(TIMESTAMP_FORMAT);
        let label = sanitize_label(label);
        let base = format!("backup-{ts}-{label}");
        let mut stem = base.clone();
        let mut n = 1;
        loop {
            let path = self.backups_dir.join(format!("{stem}{SNAPSHOT_SUFFIX}"));
            let manifest_path = self.backups_dir.join(format!("{stem}{MANIFEST_SUFFIX}"));
            if !path.exists() && !manifest_path.exists() {
                return (path, manifest_path);
            }
            n += 1;
            stem = format!("{base}-{n}");
        }
    }
}

fn sanitize_label(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    if cleaned.is_empty() {
        "snapshot".to_string()
    } else {
        cleaned
    }
}

fn restrict_dir_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o700)) {
            warn!("cannot restrict permissions on {}: {}", path.display(), e);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}

/// Remove any leftover `.staging` files from a previous crash.
fn cleanup_staging_dir(staging_dir: &Path) {
    if let Ok(entries) = fs::read_dir(staging_dir) {
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().ends_with(".staging") {
                warn!(path = %entry.path().display(), "removing orphaned backup staging file");
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn snapshot_restore_roundtrip_is_byte_identical() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("store.json");
        fs::write(&source, b"{\"tables\":{\"proposals\":[{\"id\":1}]}}").unwrap();
        let manager = BackupManager::open(dir.path().join("backups")).unwrap();

        let handle = manager.snapshot(&source, "pre-migration").unwrap();
        assert_eq!(fs::read(&handle.path).unwrap(), fs::read(&source).unwrap());

        fs::write(&source, b"clobbered").unwrap();
        manager.restore(&handle).unwrap();
        assert_eq!(
            fs::read(&source).unwrap(),
            b"{\"tables\":{\"proposals\":[{\"id\":1}]}}"
        );
    }

    #[test]
    fn restore_refuses_a_corrupted_snapshot() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("store.json");
        fs::write(&source, b"original content").unwrap();
        let manager = BackupManager::open(dir.path().join("backups")).unwrap();
        let handle = manager.snapshot(&source, "manual").unwrap();

        let mut bytes = fs::read(&handle.path).unwrap();
        bytes[0] ^= 0xff;
        fs::write(&handle.path, &bytes).unwrap();

        assert!(matches!(
            manager.restore(&handle),
            Err(KeeperError::BackupFailed(_))
        ));
        // live file untouched by the failed restore
        assert_eq!(fs::read(&source).unwrap(), b"original content");
    }

    #[test]
    fn list_is_newest_first_and_latest_filters_by_label() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("store.json");
        fs::write(&source, b"v1").unwrap();
        let manager = BackupManager::open(dir.path().join("backups")).unwrap();

        let first = manager.snapshot(&source, "manual").unwrap();
        fs::write(&source, b"v2").unwrap();
        let second = manager.snapshot(&source, "pre-migration").unwrap();

        let listed = manager.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].path, second.path);
        assert_eq!(listed[1].path, first.path);

        let latest = manager.latest("manual").unwrap().unwrap();
        assert_eq!(latest.path, first.path);
        assert!(manager.latest("nope").unwrap().is_none());
    }

    #[test]
    fn prune_enforces_the_count_cap() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("store.json");
        let manager = BackupManager::open(dir.path().join("backups")).unwrap();
        for i in 0..4 {
            fs::write(&source, format!("rev-{i}")).unwrap();
            manager.snapshot(&source, "manual").unwrap();
        }

        let removed = manager
            .prune(&PrunePolicy {
                keep_last: Some(2),
                max_age: None,
            })
            .unwrap();
        assert_eq!(removed, 2);

        let remaining = manager.list().unwrap();
        assert_eq!(remaining.len(), 2);
        // the newest snapshots survive
        assert_eq!(fs::read(&remaining[0].path).unwrap(), b"rev-3");
        assert_eq!(fs::read(&remaining[1].path).unwrap(), b"rev-2");
    }

    #[test]
    fn same_second_snapshots_get_distinct_names() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("store.json");
        fs::write(&source, b"data").unwrap();
        let manager = BackupManager::open(dir.path().join("backups")).unwrap();
        let a = manager.snapshot(&source, "manual").unwrap();
        let b = manager.snapshot(&source, "manual").unwrap();
        assert_ne!(a.path, b.path);
        assert_eq!(manager.list().unwrap().len(), 2);
    }
}
