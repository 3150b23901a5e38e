use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("passphrase must be at least {min} characters")]
    WeakPassphrase { min: usize },

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("credential hashing failed: {0}")]
    CredentialHash(String),

    #[error("AEAD encryption failed")]
    AeadEncrypt,

    #[error("AEAD decryption failed (authentication tag mismatch, possible tampering)")]
    AeadDecrypt,

    #[error("invalid key material: {0}")]
    InvalidKey(String),
}
