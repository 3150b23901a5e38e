//! Recovery credential lifecycle.
//!
//! The credential is a 160-bit random value the user stores offline. At
//! generation time the store's DEK is wrapped a second time under a KEK
//! derived from the credential, giving recovery its own decryption path:
//! a forgotten passphrase never has to be involved. The metadata singleton
//! keeps the credential ciphertext (under the DEK) and its verification
//! hash; the hash is mirrored into the plaintext header slot so candidates
//! can be checked while the store is locked.

use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use std::path::Path;
use tracing::warn;
use zeroize::Zeroizing;

use keeper_crypto::{aead, kdf};

use crate::error::KeeperError;
use crate::store::{EncryptedStore, RecoverySlot, StoreHeader, RECOVERY_SLOT_AAD};

pub const CREDENTIAL_BYTES: usize = 20;
const CREDENTIAL_GROUP: usize = 5;
const CREDENTIAL_AAD: &[u8] = b"keeper-recovery-credential";

/// Plaintext recovery credential, returned to the caller exactly once for
/// offline storage. Never persisted in this form.
pub struct RecoveryCredential(Zeroizing<String>);

impl RecoveryCredential {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for RecoveryCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RecoveryCredential(***)")
    }
}

/// Generate a fresh credential for an unlocked store, replacing any previous
/// one. Persists the new slot and metadata atomically before returning.
pub fn generate(store: &mut EncryptedStore) -> Result<RecoveryCredential, KeeperError> {
    let mut raw = Zeroizing::new([0u8; CREDENTIAL_BYTES]);
    OsRng.fill_bytes(&mut *raw);
    let formatted = format_credential(&raw[..]);
    let normalized = normalize(&formatted);

    let salt = kdf::generate_salt();
    let recovery_kek = kdf::derive_recovery_kek(normalized.as_bytes(), &salt)?;
    let wrapped = aead::wrap_dek(&recovery_kek.0, store.dek(), RECOVERY_SLOT_AAD)?;
    let credential_hash = kdf::hash_credential(normalized.as_bytes())?;
    let encrypted = aead::encrypt(store.dek(), normalized.as_bytes(), CREDENTIAL_AAD)?;

    let now = Utc::now();
    store.set_recovery_slot(RecoverySlot {
        salt: general_purpose::STANDARD.encode(salt),
        wrapped_dek: general_purpose::STANDARD.encode(wrapped),
        credential_hash: credential_hash.clone(),
        updated_at: now,
    });
    let metadata = store.metadata_mut();
    metadata.recovery_key_encrypted = Some(general_purpose::STANDARD.encode(encrypted));
    metadata.recovery_key_hash = Some(credential_hash);
    metadata.updated_at = now;
    store.save()?;

    Ok(RecoveryCredential(Zeroizing::new(formatted)))
}

/// Timing-safe check of a candidate credential against the header slot.
/// Works while the store is locked; no side effects and the encrypted
/// payload is never touched.
pub fn verify(header: &StoreHeader, candidate: &str) -> Result<bool, KeeperError> {
    let slot = header
        .recovery_slot
        .as_ref()
        .ok_or(KeeperError::RecoveryNotConfigured)?;
    let normalized = normalize(candidate);
    kdf::verify_credential(normalized.as_bytes(), &slot.credential_hash)
        .map_err(|_| KeeperError::MetadataCorrupted)
}

/// Open the store with a recovery credential instead of the passphrase.
pub fn recover(path: &Path, candidate: &str) -> Result<EncryptedStore, KeeperError> {
    let header = EncryptedStore::read_header(path)?;
    if !verify(&header, candidate)? {
        return Err(KeeperError::InvalidRecoveryCredential);
    }
    let slot = header
        .recovery_slot
        .as_ref()
        .ok_or(KeeperError::RecoveryNotConfigured)?;

    let salt = general_purpose::STANDARD
        .decode(&slot.salt)
        .map_err(|_| KeeperError::MetadataCorrupted)?;
    let normalized = normalize(candidate);
    let recovery_kek = kdf::derive_recovery_kek(normalized.as_bytes(), &salt)?;

    // The hash matched, so a failed unwrap means the slot itself is damaged.
    let dek = EncryptedStore::unwrap_recovery_slot(slot, &recovery_kek).map_err(|e| {
        warn!(error = %e, "recovery slot failed to unwrap after hash verification");
        KeeperError::MetadataCorrupted
    })?;

    EncryptedStore::open_with_dek(path, dek)
}

/// Hex credential grouped for readability: 8 groups of 5 characters.
fn format_credential(raw: &[u8]) -> String {
    let hex = hex::encode(raw);
    hex.as_bytes()
        .chunks(CREDENTIAL_GROUP)
        .map(|chunk| std::str::from_utf8(chunk).unwrap_or_default())
        .collect::<Vec<_>>()
        .join("-")
}

/// Strip separators and case so user input matches the generated form.
fn normalize(candidate: &str) -> Zeroizing<String> {
    Zeroizing::new(
        candidate
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .collect::<String>()
            .to_ascii_lowercase(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use keeper_crypto::kdf::DerivedKey;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn fresh_store(dir: &Path) -> EncryptedStore {
        EncryptedStore::create_at(&dir.join("store.keeper"), &DerivedKey([3u8; 32]), BTreeMap::new())
            .unwrap()
    }

    #[test]
    fn generate_then_verify_roundtrip() {
        let dir = tempdir().unwrap();
        let mut store = fresh_store(dir.path());
        let credential = generate(&mut store).unwrap();

        let header = EncryptedStore::read_header(&dir.path().join("store.keeper")).unwrap();
        assert!(verify(&header, credential.expose()).unwrap());
        assert!(!verify(&header, "aaaaa-bbbbb-ccccc-ddddd-eeeee-fffff-00000-11111").unwrap());

        // metadata row carries both artifacts
        assert!(store.metadata().recovery_key_encrypted.is_some());
        assert!(store.metadata().recovery_key_hash.is_some());
    }

    #[test]
    fn recover_opens_the_same_store() {
        let dir = tempdir().unwrap();
        let mut store = fresh_store(dir.path());
        let store_id = store.store_id().to_string();
        let credential = generate(&mut store).unwrap();
        drop(store);

        let path = dir.path().join("store.keeper");
        let recovered = recover(&path, credential.expose()).unwrap();
        assert_eq!(recovered.store_id(), store_id);
    }

    #[test]
    fn wrong_credential_is_rejected() {
        let dir = tempdir().unwrap();
        let mut store = fresh_store(dir.path());
        let _ = generate(&mut store).unwrap();
        drop(store);

        let path = dir.path().join("store.keeper");
        assert!(matches!(
            recover(&path, "aaaaa-bbbbb-ccccc-ddddd-eeeee-fffff-00000-11111"),
            Err(KeeperError::InvalidRecoveryCredential)
        ));
    }

    #[test]
    fn verify_without_a_slot_reports_not_configured() {
        let dir = tempdir().unwrap();
        let store = fresh_store(dir.path());
        drop(store);
        let header = EncryptedStore::read_header(&dir.path().join("store.keeper")).unwrap();
        assert!(matches!(
            verify(&header, "whatever-credential"),
            Err(KeeperError::RecoveryNotConfigured)
        ));
    }

    #[test]
    fn regenerating_rotates_the_credential() {
        let dir = tempdir().unwrap();
        let mut store = fresh_store(dir.path());
        let first = generate(&mut store).unwrap();
        let second = generate(&mut store).unwrap();
        drop(store);

        let path = dir.path().join("store.keeper");
        assert!(matches!(
            recover(&path, first.expose()),
            Err(KeeperError::InvalidRecoveryCredential)
        ));
        assert!(recover(&path, second.expose()).is_ok());
    }

    #[test]
    fn normalization_tolerates_separators_and_case() {
        let dir = tempdir().unwrap();
        let mut store = fresh_store(dir.path());
        let credential = generate(&mut store).unwrap();
        drop(store);

        let sloppy = credential.expose().replace('-', " ").to_uppercase();
        let path = dir.path().join("store.keeper");
        assert!(recover(&path, &sloppy).is_ok());
    }
}
