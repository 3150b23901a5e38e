//! One-time conversion of the legacy plaintext store into the encrypted
//! container.
//!
//! Stages run `NotStarted -> BackingUp -> Converting -> Verifying ->
//! Committed`; any failure past BackingUp rolls back to the pre-migration
//! snapshot and ends in `RolledBack`. Both terminal states are safe to
//! re-invoke: Committed short-circuits to a successful unlock, RolledBack
//! restarts from the beginning. The migration state itself is never stored;
//! it is recomputed from the filesystem on every call, so an interrupted run
//! heals on the next attempt instead of trusting a stale flag.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use keeper_crypto::kdf;

use crate::backup::{BackupHandle, BackupManager};
use crate::error::KeeperError;
use crate::keeper::unlock_store;
use crate::layout::StoreLayout;
use crate::legacy::LegacyStore;
use crate::lockfile::MigrationLock;
use crate::salt;
use crate::store::EncryptedStore;

pub(crate) const PRE_MIGRATION_LABEL: &str = "pre-migration";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationStage {
    NotStarted,
    BackingUp,
    Converting,
    Verifying,
    Committed,
    RolledBack,
}

/// Computed fresh from the filesystem; never cached across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    /// Legacy store (or nothing at all) present, no encrypted container.
    Unmigrated,
    /// Encrypted container present and structurally sound.
    Migrated,
    /// Partial artifacts from an interrupted run, or a container that fails
    /// the structural check.
    Inconsistent,
}

#[derive(Debug, Clone, Copy)]
pub struct MigrationProgress {
    pub stage: MigrationStage,
    pub tables_done: u64,
    pub tables_total: u64,
}

pub struct MigrationEngine<'a> {
    layout: &'a StoreLayout,
}

impl<'a> MigrationEngine<'a> {
    pub fn new(layout: &'a StoreLayout) -> Self {
        Self { layout }
    }

    /// Probe the storage location and classify it.
    pub fn probe(&self) -> MigrationState {
        let encrypted = self.layout.encrypted_store_path();
        if encrypted.exists() {
            match EncryptedStore::read_header(&encrypted) {
                Ok(_) => MigrationState::Migrated,
                Err(e) => {
                    warn!(error = %e, "encrypted store fails the structural check");
                    MigrationState::Inconsistent
                }
            }
        } else if self.layout.partial_store_path().exists() {
            MigrationState::Inconsistent
        } else {
            MigrationState::Unmigrated
        }
    }

    /// Run the migration under the filesystem lock and return the opened,
    /// verified store on success.
    pub fn migrate(
        &self,
        passphrase: &str,
        on_progress: &mut dyn FnMut(MigrationProgress),
    ) -> Result<EncryptedStore, KeeperError> {
        kdf::ensure_passphrase_strength(passphrase).map_err(|_| KeeperError::WeakPassphrase)?;
        self.layout.ensure_root()?;

        let lock = MigrationLock::acquire(&self.layout.migration_lock_path())?;
        let result = self.run(passphrase, on_progress);
        lock.release();
        result
    }

    fn run(
        &self,
        passphrase: &str,
        on_progress: &mut dyn FnMut(MigrationProgress),
    ) -> Result<EncryptedStore, KeeperError> {
        match self.probe() {
            MigrationState::Migrated => {
                info!("store already encrypted, conversion skipped");
                let store = unlock_store(self.layout, passphrase)?;
                self.cleanup_leftover_legacy();
                report(on_progress, MigrationStage::Committed, 0, 0);
                return Ok(store);
            }
            MigrationState::Inconsistent => self.heal()?,
            MigrationState::Unmigrated => {}
        }

        // BackingUp
        report(on_progress, MigrationStage::BackingUp, 0, 0);
        let backups = BackupManager::open(self.layout.backups_dir())?;
        let legacy_path = self.layout.legacy_store_path();
        let pre_migration = if legacy_path.exists() {
            Some(backups.snapshot(&legacy_path, PRE_MIGRATION_LABEL)?)
        } else {
            info!("fresh install, no legacy store to back up");
            None
        };

        let staged = self
            .convert_and_verify(passphrase, &legacy_path, on_progress)
            .and_then(|store| self.promote(store));
        match staged {
            Ok(store) => {
                if legacy_path.exists() {
                    if let Err(e) = fs::remove_file(&legacy_path) {
                        // the encrypted store is live; a lingering legacy
                        // file is cleaned up on the next migrate call
                        warn!(error = %e, "could not remove legacy store after commit");
                    }
                }
                info!(store_id = %store.store_id(), "migration committed");
                report(on_progress, MigrationStage::Committed, 0, 0);
                Ok(store)
            }
            Err((stage, cause)) => {
                warn!(?stage, %cause, "migration failed, rolling back");
                self.rollback(&backups, pre_migration.as_ref(), &legacy_path);
                report(on_progress, MigrationStage::RolledBack, 0, 0);
                Err(KeeperError::MigrationFailed { stage, cause })
            }
        }
    }

    fn convert_and_verify(
        &self,
        passphrase: &str,
        legacy_path: &Path,
        on_progress: &mut dyn FnMut(MigrationProgress),
    ) -> Result<EncryptedStore, (MigrationStage, String)> {
        let converting = |e: KeeperError| (MigrationStage::Converting, e.internal_detail());
        let verifying = |e: KeeperError| (MigrationStage::Verifying, e.internal_detail());

        report(on_progress, MigrationStage::Converting, 0, 0);
        let salt = salt::ensure(&self.layout.salt_path()).map_err(converting)?;
        let kek = kdf::derive(passphrase, &salt)
            .map_err(|e| (MigrationStage::Converting, e.to_string()))?;

        let legacy = if legacy_path.exists() {
            LegacyStore::load(legacy_path).map_err(converting)?
        } else {
            LegacyStore::default()
        };
        let source_counts = legacy.row_counts();
        let source_checksum = table_checksum(&legacy.tables);
        let tables_total = legacy.tables.len() as u64;

        let partial = self.layout.partial_store_path();
        if partial.exists() {
            let _ = fs::remove_file(&partial);
        }

        let mut tables = BTreeMap::new();
        for (done, (name, rows)) in legacy.tables.iter().enumerate() {
            tables.insert(name.clone(), rows.clone());
            report(
                on_progress,
                MigrationStage::Converting,
                done as u64 + 1,
                tables_total,
            );
        }
        let store = EncryptedStore::create_at(&partial, &kek, tables).map_err(converting)?;
        drop(store);

        // Trial open from disk with the freshly derived key; the in-memory
        // copy from create_at proves nothing about what actually landed.
        report(on_progress, MigrationStage::Verifying, 0, tables_total);
        let header = EncryptedStore::read_header(&partial).map_err(verifying)?;
        let dek = EncryptedStore::unwrap_passphrase_slot(&header, &kek)
            .map_err(|e| (MigrationStage::Verifying, e.to_string()))?;
        let store = EncryptedStore::open_with_dek(&partial, dek).map_err(verifying)?;

        if store.row_counts() != source_counts {
            return Err((
                MigrationStage::Verifying,
                "row counts differ between source and target".into(),
            ));
        }
        if table_checksum(store.tables()) != source_checksum {
            return Err((
                MigrationStage::Verifying,
                "content checksum differs between source and target".into(),
            ));
        }
        Ok(store)
    }

    /// Promote the verified container into its final path. The legacy file
    /// is only retired after this rename has landed.
    fn promote(
        &self,
        mut store: EncryptedStore,
    ) -> Result<EncryptedStore, (MigrationStage, String)> {
        let partial = self.layout.partial_store_path();
        let encrypted = self.layout.encrypted_store_path();
        fs::rename(&partial, &encrypted).map_err(|e| {
            (
                MigrationStage::Verifying,
                format!("promote encrypted store: {e}"),
            )
        })?;
        let _ = crate::fsutil::fsync_dir(self.layout.root());
        store.relocate(&encrypted);
        Ok(store)
    }

    fn rollback(
        &self,
        backups: &BackupManager,
        pre_migration: Option<&BackupHandle>,
        legacy_path: &Path,
    ) {
        let partial = self.layout.partial_store_path();
        if partial.exists() {
            let _ = fs::remove_file(&partial);
        }
        let Some(handle) = pre_migration else {
            return;
        };
        if legacy_intact(legacy_path, handle) {
            return;
        }
        warn!("legacy store missing or altered, restoring pre-migration snapshot");
        if let Err(e) = backups.restore_to(handle, legacy_path) {
            warn!(error = %e, "rollback restore failed; snapshot remains available");
        }
    }

    /// Clear the wreckage of an interrupted run so migration can restart
    /// from a clean Unmigrated state.
    fn heal(&self) -> Result<(), KeeperError> {
        warn!("store location is inconsistent, attempting self-heal");
        let failed = |cause: String| KeeperError::MigrationFailed {
            stage: MigrationStage::NotStarted,
            cause,
        };

        let partial = self.layout.partial_store_path();
        if partial.exists() {
            let _ = fs::remove_file(&partial);
        }

        let encrypted = self.layout.encrypted_store_path();
        if encrypted.exists() {
            let aside = encrypted.with_file_name(format!(
                "store.keeper.corrupt-{}",
                chrono::Utc::now().format("%Y-%m-%dT%H-%M-%S")
            ));
            fs::rename(&encrypted, &aside)
                .map_err(|e| failed(format!("set aside corrupt store: {e}")))?;
            warn!(path = %aside.display(), "corrupt encrypted store set aside");
        }

        let legacy = self.layout.legacy_store_path();
        if !legacy.exists() {
            let backups =
                BackupManager::open(self.layout.backups_dir()).map_err(|e| failed(e.internal_detail()))?;
            match backups.latest(PRE_MIGRATION_LABEL)? {
                Some(handle) => {
                    backups
                        .restore_to(&handle, &legacy)
                        .map_err(|e| failed(e.internal_detail()))?;
                    info!("legacy store restored from pre-migration snapshot");
                }
                None => {
                    return Err(failed(
                        "no legacy store and no pre-migration snapshot to restore".into(),
                    ))
                }
            }
        }
        Ok(())
    }

    fn cleanup_leftover_legacy(&self) {
        let legacy = self.layout.legacy_store_path();
        if legacy.exists() {
            // commit previously renamed the verified container into place,
            // only the legacy removal was interrupted
            warn!("removing leftover legacy store next to a verified encrypted store");
            if let Err(e) = fs::remove_file(&legacy) {
                warn!(error = %e, "could not remove leftover legacy store");
            }
        }
    }
}

fn report(
    on_progress: &mut dyn FnMut(MigrationProgress),
    stage: MigrationStage,
    tables_done: u64,
    tables_total: u64,
) {
    on_progress(MigrationProgress {
        stage,
        tables_done,
        tables_total,
    });
}

fn legacy_intact(legacy_path: &Path, handle: &BackupHandle) -> bool {
    let Ok(data) = fs::read(legacy_path) else {
        return false;
    };
    keeper_crypto::hash::content_hex(&data) == handle.manifest.checksum
}

/// Canonical digest over table names, row counts and row content; compared
/// between source and target during verification. Tables are iterated in
/// key order, so the digest is stable across loads.
pub(crate) fn table_checksum(tables: &BTreeMap<String, Vec<serde_json::Value>>) -> String {
    let mut hasher = Sha256::new();
    for (name, rows) in tables {
        hasher.update(name.as_bytes());
        hasher.update(b"|");
        hasher.update((rows.len() as u64).to_le_bytes());
        for row in rows {
            hasher.update(row.to_string().as_bytes());
            hasher.update(b"\x00");
        }
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const PASSPHRASE: &str = "correct-horse-battery";

    fn seed_legacy(layout: &StoreLayout) {
        fs::create_dir_all(layout.root()).unwrap();
        fs::write(
            layout.legacy_store_path(),
            r#"{"tables":{"proposals":[{"id":1,"title":"alpha"},{"id":2,"title":"beta"}],"settings":[{"theme":"dark"}]}}"#,
        )
        .unwrap();
    }

    fn quiet() -> impl FnMut(MigrationProgress) {
        |_| {}
    }

    #[test]
    fn fresh_install_migrates_to_an_empty_encrypted_store() {
        let dir = tempdir().unwrap();
        let layout = StoreLayout::at(dir.path());
        let engine = MigrationEngine::new(&layout);
        assert_eq!(engine.probe(), MigrationState::Unmigrated);

        let store = engine.migrate(PASSPHRASE, &mut quiet()).unwrap();
        assert!(store.tables().is_empty());
        assert_eq!(engine.probe(), MigrationState::Migrated);
        assert!(!layout.legacy_store_path().exists());
        assert!(!layout.migration_lock_path().exists());
    }

    #[test]
    fn legacy_data_survives_migration_and_the_legacy_file_is_retired() {
        let dir = tempdir().unwrap();
        let layout = StoreLayout::at(dir.path());
        seed_legacy(&layout);

        let engine = MigrationEngine::new(&layout);
        let mut stages = Vec::new();
        let store = engine
            .migrate(PASSPHRASE, &mut |p| stages.push(p.stage))
            .unwrap();

        assert_eq!(store.row_counts()["proposals"], 2);
        assert_eq!(store.row_counts()["settings"], 1);
        assert!(!layout.legacy_store_path().exists());
        assert!(layout.encrypted_store_path().exists());
        assert_eq!(stages.first(), Some(&MigrationStage::BackingUp));
        assert_eq!(stages.last(), Some(&MigrationStage::Committed));
        assert!(stages.contains(&MigrationStage::Converting));
        assert!(stages.contains(&MigrationStage::Verifying));

        // the pre-migration snapshot exists and matches the old content
        let backups = BackupManager::open(layout.backups_dir()).unwrap();
        let snapshot = backups.latest(PRE_MIGRATION_LABEL).unwrap().unwrap();
        assert!(snapshot.manifest.size > 0);
    }

    #[test]
    fn migrate_is_idempotent_after_commit() {
        let dir = tempdir().unwrap();
        let layout = StoreLayout::at(dir.path());
        seed_legacy(&layout);
        let engine = MigrationEngine::new(&layout);
        engine.migrate(PASSPHRASE, &mut quiet()).unwrap();

        let backups = BackupManager::open(layout.backups_dir()).unwrap();
        let snapshots_before = backups.list().unwrap().len();

        let mut stages = Vec::new();
        let store = engine
            .migrate(PASSPHRASE, &mut |p| stages.push(p.stage))
            .unwrap();
        assert_eq!(store.row_counts()["proposals"], 2);
        assert_eq!(stages, vec![MigrationStage::Committed]);
        // no second backup was created
        assert_eq!(backups.list().unwrap().len(), snapshots_before);
    }

    #[test]
    fn interrupted_conversion_rolls_back_and_leaves_legacy_byte_identical() {
        let dir = tempdir().unwrap();
        let layout = StoreLayout::at(dir.path());
        seed_legacy(&layout);
        let legacy_before = fs::read(layout.legacy_store_path()).unwrap();

        let engine = MigrationEngine::new(&layout);
        let partial = layout.partial_store_path();
        let mut saw_rollback = false;
        let result = engine.migrate(PASSPHRASE, &mut |p| {
            // simulate a crash mid-write: truncate the in-flight target just
            // before the verification pass re-opens it
            if p.stage == MigrationStage::Verifying && partial.exists() {
                let bytes = fs::read(&partial).unwrap();
                fs::write(&partial, &bytes[..bytes.len() / 2]).unwrap();
            }
            if p.stage == MigrationStage::RolledBack {
                saw_rollback = true;
            }
        });

        match result {
            Err(KeeperError::MigrationFailed { stage, .. }) => {
                assert_eq!(stage, MigrationStage::Verifying);
            }
            other => panic!("expected MigrationFailed, got {other:?}"),
        }
        assert!(saw_rollback);
        assert!(!partial.exists());
        assert!(!layout.encrypted_store_path().exists());
        assert_eq!(fs::read(layout.legacy_store_path()).unwrap(), legacy_before);
        assert!(!layout.migration_lock_path().exists());

        // a rerun from the rolled-back state succeeds
        let store = engine.migrate(PASSPHRASE, &mut quiet()).unwrap();
        assert_eq!(store.row_counts()["proposals"], 2);
    }

    #[test]
    fn a_held_lock_surfaces_contention_without_touching_backups() {
        let dir = tempdir().unwrap();
        let layout = StoreLayout::at(dir.path());
        seed_legacy(&layout);

        let lock = MigrationLock::acquire(&layout.migration_lock_path()).unwrap();
        let engine = MigrationEngine::new(&layout);
        assert!(matches!(
            engine.migrate(PASSPHRASE, &mut quiet()),
            Err(KeeperError::LockContention)
        ));
        assert!(!layout.backups_dir().exists());
        lock.release();
    }

    #[test]
    fn concurrent_migrations_do_not_race() {
        let dir = tempdir().unwrap();
        let layout = StoreLayout::at(dir.path());
        seed_legacy(&layout);

        let worker_layout = layout.clone();
        let worker = std::thread::spawn(move || {
            let engine = MigrationEngine::new(&worker_layout);
            engine
                .migrate(PASSPHRASE, &mut |_| {})
                .map(|store| store.store_id().to_string())
        });

        // wait until the worker holds the lock; it keeps it through the
        // whole derivation, which leaves a wide window
        let lock_path = layout.migration_lock_path();
        let start = std::time::Instant::now();
        while !lock_path.exists() && start.elapsed() < std::time::Duration::from_secs(10) {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert!(lock_path.exists(), "worker never acquired the migration lock");

        let engine = MigrationEngine::new(&layout);
        assert!(matches!(
            engine.migrate(PASSPHRASE, &mut quiet()),
            Err(KeeperError::LockContention)
        ));

        let store_id = worker.join().unwrap().unwrap();
        assert!(!store_id.is_empty());
        // the contender did not disturb the worker's backup
        let backups = BackupManager::open(layout.backups_dir()).unwrap();
        assert!(backups.latest(PRE_MIGRATION_LABEL).unwrap().is_some());
    }

    #[test]
    fn weak_passphrase_is_rejected_before_any_work() {
        let dir = tempdir().unwrap();
        let layout = StoreLayout::at(dir.path());
        seed_legacy(&layout);
        let engine = MigrationEngine::new(&layout);
        assert!(matches!(
            engine.migrate("short", &mut quiet()),
            Err(KeeperError::WeakPassphrase)
        ));
        assert!(!layout.backups_dir().exists());
        assert!(!layout.migration_lock_path().exists());
    }

    #[test]
    fn corrupt_container_probes_inconsistent_and_heals_on_migrate() {
        let dir = tempdir().unwrap();
        let layout = StoreLayout::at(dir.path());
        seed_legacy(&layout);
        let engine = MigrationEngine::new(&layout);
        engine.migrate(PASSPHRASE, &mut quiet()).unwrap();

        // clobber the container
        fs::write(layout.encrypted_store_path(), b"garbage").unwrap();
        assert_eq!(engine.probe(), MigrationState::Inconsistent);

        // legacy file is gone, so heal restores it from the snapshot and the
        // migration runs again end to end
        let store = engine.migrate(PASSPHRASE, &mut quiet()).unwrap();
        assert_eq!(store.row_counts()["proposals"], 2);
        assert_eq!(engine.probe(), MigrationState::Migrated);
    }

    #[test]
    fn leftover_partial_probes_inconsistent() {
        let dir = tempdir().unwrap();
        let layout = StoreLayout::at(dir.path());
        fs::create_dir_all(layout.root()).unwrap();
        fs::write(layout.partial_store_path(), b"half-written").unwrap();
        let engine = MigrationEngine::new(&layout);
        assert_eq!(engine.probe(), MigrationState::Inconsistent);
    }
}
