//! Host-facing facade.
//!
//! The host process owns a single `Keeper` and drives everything through
//! it: status probing, unlock, migration, recovery, rotation and the opt-in
//! auto-unlock cache. Operations that derive keys or copy stores block for
//! hundreds of milliseconds to seconds; hosts run them off any
//! latency-sensitive path and surface the migration progress callback.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use zeroize::Zeroizing;

use keeper_crypto::kdf;

use crate::backup::{BackupHandle, BackupManager};
use crate::error::KeeperError;
use crate::layout::StoreLayout;
use crate::lockfile::MigrationLock;
use crate::migration::{MigrationEngine, MigrationProgress, MigrationState};
use crate::recovery::{self, RecoveryCredential};
use crate::salt;
use crate::secure_storage::{KeyringSecretStore, SecretStore, SecretStoreError};
use crate::session::Session;
use crate::store::EncryptedStore;

const PRE_ROTATION_LABEL: &str = "pre-rotation";

/// Recovery retry backoff: (attempt threshold, delay ms), checked in
/// descending order, first match wins.
const RECOVERY_BACKOFF: &[(u32, u64)] = &[
    (10, 300_000), // 10+ attempts: 5 minutes
    (8, 30_000),   //  8+ attempts: 30 seconds
    (5, 5_000),    //  5+ attempts: 5 seconds
    (3, 1_000),    //  3+ attempts: 1 second
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStatus {
    pub needs_migration: bool,
    pub is_locked: bool,
}

#[derive(Default)]
struct RecoveryThrottle {
    attempts: u32,
    last_failure: Option<Instant>,
}

impl RecoveryThrottle {
    fn remaining_ms(&self) -> Option<u64> {
        let last = self.last_failure?;
        let delay_ms = RECOVERY_BACKOFF
            .iter()
            .find(|(threshold, _)| self.attempts >= *threshold)
            .map(|(_, delay)| *delay)?;
        let elapsed_ms = last.elapsed().as_millis() as u64;
        (elapsed_ms < delay_ms).then(|| delay_ms - elapsed_ms)
    }

    fn record_failure(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
        self.last_failure = Some(Instant::now());
    }

    fn reset(&mut self) {
        self.attempts = 0;
        self.last_failure = None;
    }
}

pub struct Keeper {
    layout: StoreLayout,
    secrets: Box<dyn SecretStore>,
    liveness: Arc<()>,
    throttle: Mutex<RecoveryThrottle>,
}

impl Keeper {
    /// Keeper over `layout` with the platform credential store.
    pub fn new(layout: StoreLayout) -> Self {
        Self::with_secret_store(layout, Box::new(KeyringSecretStore::new()))
    }

    /// Keeper with an explicit secret-store backend (tests, headless hosts).
    pub fn with_secret_store(layout: StoreLayout, secrets: Box<dyn SecretStore>) -> Self {
        Self {
            layout,
            secrets,
            liveness: Arc::new(()),
            throttle: Mutex::new(RecoveryThrottle::default()),
        }
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    /// Probe the filesystem and report whether migration is needed and
    /// whether a session is currently active.
    pub fn check_status(&self) -> StoreStatus {
        let state = MigrationEngine::new(&self.layout).probe();
        StoreStatus {
            needs_migration: state != MigrationState::Migrated,
            is_locked: Arc::strong_count(&self.liveness) == 1,
        }
    }

    /// Unlock with the passphrase. Freely retryable; a wrong passphrase has
    /// no side effects and there is no lockout counter.
    pub fn unlock(&self, passphrase: &str) -> Result<Session, KeeperError> {
        let store = unlock_store(&self.layout, passphrase)?;
        info!(store_id = %store.store_id(), "store unlocked");
        Ok(Session::new(store, self.liveness.clone()))
    }

    /// Convert the legacy store (or initialise a fresh one) under a new
    /// passphrase, reporting progress, and return the unlocked session.
    pub fn migrate(
        &self,
        new_passphrase: &str,
        mut on_progress: impl FnMut(MigrationProgress),
    ) -> Result<Session, KeeperError> {
        let engine = MigrationEngine::new(&self.layout);
        let store = engine.migrate(new_passphrase, &mut on_progress)?;
        Ok(Session::new(store, self.liveness.clone()))
    }

    /// Generate (or rotate) the recovery credential for an active session.
    /// The returned plaintext is shown to the user once and never persisted.
    pub fn generate_recovery(
        &self,
        session: &mut Session,
    ) -> Result<RecoveryCredential, KeeperError> {
        recovery::generate(session.store_mut())
    }

    /// Timing-safe candidate check without opening the store.
    pub fn verify_recovery(&self, candidate: &str) -> Result<bool, KeeperError> {
        let path = self.layout.encrypted_store_path();
        if !path.exists() {
            return Err(KeeperError::StoreMissing);
        }
        let header = EncryptedStore::read_header(&path)?;
        recovery::verify(&header, candidate)
    }

    /// Unlock with the recovery credential. Retries are bounded by a
    /// backoff schedule; after repeated failures callers should steer the
    /// user toward a passphrase reset.
    pub fn recover_with(&self, candidate: &str) -> Result<Session, KeeperError> {
        if let Some(remaining_ms) = self.throttle.lock().remaining_ms() {
            return Err(KeeperError::RecoveryThrottled { remaining_ms });
        }
        let path = self.layout.encrypted_store_path();
        if !path.exists() {
            return Err(KeeperError::StoreMissing);
        }
        match recovery::recover(&path, candidate) {
            Ok(store) => {
                self.throttle.lock().reset();
                info!(store_id = %store.store_id(), "store unlocked via recovery credential");
                Ok(Session::new(store, self.liveness.clone()))
            }
            Err(e @ KeeperError::InvalidRecoveryCredential) => {
                let mut throttle = self.throttle.lock();
                throttle.record_failure();
                warn!(attempts = throttle.attempts, "recovery attempt rejected");
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Change the passphrase of an unlocked store. Re-wraps the DEK under
    /// the new passphrase; the payload and the recovery slot are untouched.
    /// Guarded by the migration lock and a pre-rotation snapshot.
    pub fn rotate_passphrase(
        &self,
        session: &mut Session,
        current_passphrase: &str,
        new_passphrase: &str,
    ) -> Result<(), KeeperError> {
        kdf::ensure_passphrase_strength(new_passphrase)
            .map_err(|_| KeeperError::WeakPassphrase)?;

        let lock = MigrationLock::acquire(&self.layout.migration_lock_path())?;
        let result = self.rotate_inner(session, current_passphrase, new_passphrase);
        lock.release();
        result
    }

    fn rotate_inner(
        &self,
        session: &mut Session,
        current_passphrase: &str,
        new_passphrase: &str,
    ) -> Result<(), KeeperError> {
        let store_salt = salt::load(&self.layout.salt_path())?;

        // re-authenticate before touching anything
        let current_kek = kdf::derive(current_passphrase, &store_salt)?;
        EncryptedStore::unwrap_passphrase_slot(session.store().header(), &current_kek)
            .map_err(|_| KeeperError::InvalidPassphrase)?;

        let backups = BackupManager::open(self.layout.backups_dir())?;
        backups.snapshot(&self.layout.encrypted_store_path(), PRE_ROTATION_LABEL)?;

        let new_kek = kdf::derive(new_passphrase, &store_salt)?;
        session.store_mut().rewrap_passphrase_slot(&new_kek)?;
        session.store_mut().save()?;
        info!(store_id = %session.store_id(), "passphrase rotated");
        Ok(())
    }

    // ── Opt-in auto-unlock cache ────────────────────────────────────────────

    /// Cache the store key in the OS credential store so the next launch can
    /// skip the prompt. Best-effort: returns false and logs when the backend
    /// is unavailable, and the passphrase path keeps working either way.
    pub fn enable_auto_unlock(&self, session: &Session) -> bool {
        let label = auto_unlock_label(session.store_id());
        match self.secrets.store(&label, session.store().dek()) {
            Ok(()) => {
                info!("auto-unlock enabled");
                true
            }
            Err(e) => {
                warn!(error = %e, "secure storage unavailable, auto-unlock not enabled");
                false
            }
        }
    }

    /// Try to open a session from the cached key. `None` means "prompt the
    /// user", whatever the reason.
    pub fn try_auto_unlock(&self) -> Option<Session> {
        let path = self.layout.encrypted_store_path();
        let header = EncryptedStore::read_header(&path).ok()?;
        let label = auto_unlock_label(&header.store_id);
        let secret = match self.secrets.retrieve(&label) {
            Ok(secret) => Zeroizing::new(secret),
            Err(SecretStoreError::NotFound) => return None,
            Err(e) => {
                warn!(error = %e, "secure storage unavailable, falling back to passphrase prompt");
                return None;
            }
        };
        let dek: [u8; 32] = match secret.as_slice().try_into() {
            Ok(dek) => dek,
            Err(_) => {
                warn!("cached unlock key has wrong length, ignoring it");
                return None;
            }
        };
        match EncryptedStore::open_with_dek(&path, Zeroizing::new(dek)) {
            Ok(store) => {
                info!(store_id = %store.store_id(), "store unlocked from cached key");
                Some(Session::new(store, self.liveness.clone()))
            }
            Err(e) => {
                warn!(error = %e, "cached key rejected, falling back to passphrase prompt");
                None
            }
        }
    }

    /// Drop the cached key. Best-effort.
    pub fn disable_auto_unlock(&self) {
        let path = self.layout.encrypted_store_path();
        let Ok(header) = EncryptedStore::read_header(&path) else {
            return;
        };
        if let Err(e) = self.secrets.remove(&auto_unlock_label(&header.store_id)) {
            warn!(error = %e, "could not remove cached unlock key");
        }
    }

    // ── Backups ─────────────────────────────────────────────────────────────

    /// Manual snapshot of the current store file (encrypted if present,
    /// otherwise the legacy file).
    pub fn snapshot(&self, label: &str) -> Result<BackupHandle, KeeperError> {
        let encrypted = self.layout.encrypted_store_path();
        let legacy = self.layout.legacy_store_path();
        let source = if encrypted.exists() {
            encrypted
        } else if legacy.exists() {
            legacy
        } else {
            return Err(KeeperError::StoreMissing);
        };
        let backups = BackupManager::open(self.layout.backups_dir())?;
        backups.snapshot(&source, label)
    }

    pub fn backups(&self) -> Result<BackupManager, KeeperError> {
        BackupManager::open(self.layout.backups_dir())
    }
}

fn auto_unlock_label(store_id: &str) -> String {
    format!("unlock-key:{store_id}")
}

/// Full passphrase unlock ceremony: salt, KEK, slot unwrap, payload open
/// with canary read. Shared between `unlock` and the idempotent-migrate
/// path.
pub(crate) fn unlock_store(
    layout: &StoreLayout,
    passphrase: &str,
) -> Result<EncryptedStore, KeeperError> {
    let path = layout.encrypted_store_path();
    if !path.exists() {
        return Err(KeeperError::StoreMissing);
    }
    let store_salt = salt::load(&layout.salt_path())?;
    let kek = kdf::derive(passphrase, &store_salt)?;
    let header = EncryptedStore::read_header(&path)?;
    let dek = EncryptedStore::unwrap_passphrase_slot(&header, &kek)
        .map_err(|_| KeeperError::InvalidPassphrase)?;
    EncryptedStore::open_with_dek(&path, dek)
}
