//! The store salt file.
//!
//! A single random salt per store, generated on first setup and immutable
//! afterwards. Stored as base64 text outside the encrypted container so it
//! can be read before the container is opened.

use base64::{engine::general_purpose, Engine as _};
use std::fs;
use std::path::Path;

use keeper_crypto::kdf;

use crate::error::KeeperError;
use crate::fsutil;

const MIN_SALT_LEN: usize = 16;

/// Load the salt file. A missing file is `StoreMissing`; unreadable or
/// undersized content is fatal to the current operation.
pub fn load(path: &Path) -> Result<Vec<u8>, KeeperError> {
    if !path.exists() {
        return Err(KeeperError::StoreMissing);
    }
    let text = fs::read_to_string(path)
        .map_err(|e| KeeperError::StoreInconsistent(format!("read salt file: {e}")))?;
    let salt = general_purpose::STANDARD
        .decode(text.trim())
        .map_err(|e| KeeperError::StoreInconsistent(format!("decode salt file: {e}")))?;
    if salt.len() < MIN_SALT_LEN {
        return Err(KeeperError::StoreInconsistent(format!(
            "salt file too short: {} bytes",
            salt.len()
        )));
    }
    Ok(salt)
}

/// Load the salt, generating and persisting a fresh one if none exists yet.
pub fn ensure(path: &Path) -> Result<Vec<u8>, KeeperError> {
    match load(path) {
        Ok(salt) => Ok(salt),
        Err(KeeperError::StoreMissing) => {
            let salt = kdf::generate_salt();
            let encoded = general_purpose::STANDARD.encode(salt);
            fsutil::write_atomic(path, encoded.as_bytes())?;
            Ok(salt.to_vec())
        }
        Err(e) => Err(e),
    }
}
