//! OS secure-storage seam, used to cache the store key between launches.
//!
//! Absence of a cached value is the normal "prompt the user" path, not an
//! error. A failing backend degrades to that same path; it must never block
//! unlock or lose data, so callers log and fall through.

use base64::{engine::general_purpose, Engine as _};
use keyring::Entry;
use parking_lot::Mutex;
use std::collections::HashMap;
use thiserror::Error;

pub const SERVICE_NAME: &str = "DraftsmithKeeper";

#[derive(Debug, Error)]
pub enum SecretStoreError {
    #[error("no secret stored under this label")]
    NotFound,

    #[error("secure storage backend failure: {0}")]
    Backend(String),
}

/// Capability interface over whatever OS-level secure storage is available.
/// Implementations vary by platform; the contract is uniform.
pub trait SecretStore: Send + Sync {
    fn store(&self, label: &str, secret: &[u8]) -> Result<(), SecretStoreError>;
    fn retrieve(&self, label: &str) -> Result<Vec<u8>, SecretStoreError>;
    fn remove(&self, label: &str) -> Result<(), SecretStoreError>;
}

/// Platform credential store (keychain, credential manager, secret service).
/// Secrets are stored base64-encoded.
pub struct KeyringSecretStore {
    service: String,
}

impl KeyringSecretStore {
    pub fn new() -> Self {
        Self {
            service: SERVICE_NAME.to_string(),
        }
    }

    fn entry(&self, label: &str) -> Result<Entry, SecretStoreError> {
        Entry::new(&self.service, label).map_err(|e| SecretStoreError::Backend(e.to_string()))
    }
}

impl Default for KeyringSecretStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretStore for KeyringSecretStore {
    fn store(&self, label: &str, secret: &[u8]) -> Result<(), SecretStoreError> {
        let encoded = general_purpose::STANDARD.encode(secret);
        self.entry(label)?
            .set_password(&encoded)
            .map_err(|e| SecretStoreError::Backend(e.to_string()))
    }

    fn retrieve(&self, label: &str) -> Result<Vec<u8>, SecretStoreError> {
        let entry = self.entry(label)?;
        match entry.get_password() {
            Ok(encoded) => general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| SecretStoreError::Backend(e.to_string())),
            Err(keyring::Error::NoEntry) => Err(SecretStoreError::NotFound),
            Err(e) => Err(SecretStoreError::Backend(e.to_string())),
        }
    }

    fn remove(&self, label: &str) -> Result<(), SecretStoreError> {
        let entry = self.entry(label)?;
        match entry.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(SecretStoreError::Backend(e.to_string())),
        }
    }
}

/// In-process secret store for tests and headless hosts.
#[derive(Default)]
pub struct MemorySecretStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemorySecretStore {
    fn store(&self, label: &str, secret: &[u8]) -> Result<(), SecretStoreError> {
        self.entries
            .lock()
            .insert(label.to_string(), secret.to_vec());
        Ok(())
    }

    fn retrieve(&self, label: &str) -> Result<Vec<u8>, SecretStoreError> {
        self.entries
            .lock()
            .get(label)
            .cloned()
            .ok_or(SecretStoreError::NotFound)
    }

    fn remove(&self, label: &str) -> Result<(), SecretStoreError> {
        self.entries.lock().remove(label);
        Ok(())
    }
}
