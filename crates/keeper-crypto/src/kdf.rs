//! Key derivation functions
//!
//! `derive` — Argon2id, turns a user passphrase plus the store salt into the
//!   32-byte key-encryption key that wraps the data encryption key.
//!
//! `derive_recovery_kek` — same primitive over a recovery credential with its
//!   own salt, producing the independent wrapping key used by recovery.
//!
//! `hash_credential` / `verify_credential` — PHC-string verification hash of
//!   the recovery credential, parameterised independently of the passphrase
//!   derivation so neither reveals anything about the other.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

pub const KDF_TIME_COST: u32 = 3;
pub const KDF_MEMORY_COST: u32 = 65536; // 64 MiB
pub const KDF_PARALLELISM: u32 = 4;
pub const DERIVED_KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 32;

/// Shorter passphrases are rejected before any expensive work starts.
pub const MIN_PASSPHRASE_CHARS: usize = 12;

// Credential verification runs with its own cost set so the stored hash is
// independent of the passphrase derivation parameters.
const CREDENTIAL_HASH_MEMORY_COST: u32 = 19456; // 19 MiB
const CREDENTIAL_HASH_TIME_COST: u32 = 2;
const CREDENTIAL_HASH_PARALLELISM: u32 = 1;

/// 32-byte key-encryption key derived from a passphrase or recovery
/// credential. Zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct DerivedKey(pub [u8; DERIVED_KEY_LEN]);

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DerivedKey(***)")
    }
}

/// Local, synchronous minimum-length check. Runs before derivation so a weak
/// passphrase never costs a full Argon2id pass.
pub fn ensure_passphrase_strength(passphrase: &str) -> Result<(), CryptoError> {
    if passphrase.chars().count() < MIN_PASSPHRASE_CHARS {
        return Err(CryptoError::WeakPassphrase {
            min: MIN_PASSPHRASE_CHARS,
        });
    }
    Ok(())
}

/// Derive the passphrase key-encryption key. Deterministic for identical
/// inputs; fails only on a weak passphrase or unusable salt.
pub fn derive(passphrase: &str, salt: &[u8]) -> Result<DerivedKey, CryptoError> {
    ensure_passphrase_strength(passphrase)?;
    derive_raw(passphrase.as_bytes(), salt)
}

/// Derive the recovery key-encryption key from a normalised recovery
/// credential and the recovery slot salt.
pub fn derive_recovery_kek(credential: &[u8], salt: &[u8]) -> Result<DerivedKey, CryptoError> {
    derive_raw(credential, salt)
}

fn derive_raw(secret: &[u8], salt: &[u8]) -> Result<DerivedKey, CryptoError> {
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, kek_params());
    let mut key = [0u8; DERIVED_KEY_LEN];
    argon
        .hash_password_into(secret, salt, &mut key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(DerivedKey(key))
}

fn kek_params() -> Params {
    Params::new(
        KDF_MEMORY_COST,
        KDF_TIME_COST,
        KDF_PARALLELISM,
        Some(DERIVED_KEY_LEN),
    )
    .expect("static Argon2 params are always valid")
}

fn credential_hasher() -> Argon2<'static> {
    let params = Params::new(
        CREDENTIAL_HASH_MEMORY_COST,
        CREDENTIAL_HASH_TIME_COST,
        CREDENTIAL_HASH_PARALLELISM,
        None,
    )
    .expect("static Argon2 params are always valid");
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
}

/// Generate a fresh random salt (call once per store; not secret).
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// PHC-string hash of a recovery credential. The salt is embedded in the
/// returned string.
pub fn hash_credential(credential: &[u8]) -> Result<String, CryptoError> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = credential_hasher()
        .hash_password(credential, &salt)
        .map_err(|e| CryptoError::CredentialHash(e.to_string()))?;
    Ok(hash.to_string())
}

/// Constant-time verification of a candidate credential against a stored
/// PHC string.
pub fn verify_credential(credential: &[u8], phc: &str) -> Result<bool, CryptoError> {
    let parsed =
        PasswordHash::new(phc).map_err(|e| CryptoError::CredentialHash(e.to_string()))?;
    match credential_hasher().verify_password(credential, &parsed) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(CryptoError::CredentialHash(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SALT: [u8; SALT_LEN] = [7u8; SALT_LEN];

    #[test]
    fn derive_is_deterministic() {
        let a = derive("correct horse battery staple", &SALT).unwrap();
        let b = derive("correct horse battery staple", &SALT).unwrap();
        assert_eq!(a.0, b.0);
    }

    #[test]
    fn derive_depends_on_both_inputs() {
        let base = derive("correct horse battery staple", &SALT).unwrap();
        let other_pass = derive("correct horse battery stapl3", &SALT).unwrap();
        let mut salt2 = SALT;
        salt2[0] ^= 1;
        let other_salt = derive("correct horse battery staple", &salt2).unwrap();
        assert_ne!(base.0, other_pass.0);
        assert_ne!(base.0, other_salt.0);
    }

    #[test]
    fn short_passphrase_is_rejected_fast() {
        let err = derive("tooshort", &SALT).unwrap_err();
        assert!(matches!(err, CryptoError::WeakPassphrase { .. }));
    }

    #[test]
    fn credential_hash_roundtrip() {
        let phc = hash_credential(b"0123456789abcdef0123").unwrap();
        assert!(verify_credential(b"0123456789abcdef0123", &phc).unwrap());
        assert!(!verify_credential(b"0123456789abcdef0124", &phc).unwrap());
    }
}
