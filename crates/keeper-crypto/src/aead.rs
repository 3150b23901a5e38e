//! Authenticated Encryption with Associated Data
//!
//! Uses XChaCha20-Poly1305 (192-bit nonce).
//! Key size: 32 bytes. Nonce: 24 bytes (random). Tag: 16 bytes.
//!
//! Ciphertext wire format:
//!   [ nonce (24 bytes) | ciphertext + tag ]

use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng as AeadOsRng},
    XChaCha20Poly1305,
};
use zeroize::Zeroizing;

use crate::error::CryptoError;

const NONCE_LEN: usize = 24;

/// Encrypt `plaintext` with a 32-byte key, prepending a random 24-byte nonce.
/// `aad` is authenticated but not encrypted; it domain-separates the uses of
/// a key (payload vs key slots) so a blob cannot be replayed across contexts.
pub fn encrypt(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AeadEncrypt)?;

    let nonce = XChaCha20Poly1305::generate_nonce(&mut AeadOsRng);

    let ciphertext = cipher
        .encrypt(
            &nonce,
            chacha20poly1305::aead::Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::AeadEncrypt)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt wire-format bytes (nonce || ciphertext+tag). Fails if the key is
/// wrong, the AAD does not match, or the data was tampered with.
pub fn decrypt(key: &[u8; 32], data: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if data.len() < NONCE_LEN {
        return Err(CryptoError::AeadDecrypt);
    }
    let (nonce_bytes, ct) = data.split_at(NONCE_LEN);
    let nonce = chacha20poly1305::XNonce::from_slice(nonce_bytes);

    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AeadDecrypt)?;

    let plaintext = cipher
        .decrypt(nonce, chacha20poly1305::aead::Payload { msg: ct, aad })
        .map_err(|_| CryptoError::AeadDecrypt)?;

    Ok(Zeroizing::new(plaintext))
}

/// Wrap a 32-byte data encryption key under a wrapping key (key transport).
pub fn wrap_dek(kek: &[u8; 32], dek: &[u8; 32], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    encrypt(kek, dek, aad)
}

/// Unwrap a wrapped data encryption key.
pub fn unwrap_dek(kek: &[u8; 32], wrapped: &[u8], aad: &[u8]) -> Result<[u8; 32], CryptoError> {
    let plaintext = decrypt(kek, wrapped, aad)?;
    if plaintext.len() != 32 {
        return Err(CryptoError::InvalidKey(
            "unwrapped key has wrong length".into(),
        ));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&plaintext);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [42u8; 32];

    #[test]
    fn roundtrip() {
        let ct = encrypt(&KEY, b"hello", b"ctx").unwrap();
        let pt = decrypt(&KEY, &ct, b"ctx").unwrap();
        assert_eq!(&pt[..], b"hello");
    }

    #[test]
    fn tampering_is_detected() {
        let mut ct = encrypt(&KEY, b"hello", b"ctx").unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0x01;
        assert!(decrypt(&KEY, &ct, b"ctx").is_err());
    }

    #[test]
    fn aad_mismatch_is_rejected() {
        let ct = encrypt(&KEY, b"hello", b"ctx-a").unwrap();
        assert!(decrypt(&KEY, &ct, b"ctx-b").is_err());
    }

    #[test]
    fn wrap_unwrap_dek() {
        let dek = [9u8; 32];
        let wrapped = wrap_dek(&KEY, &dek, b"slot").unwrap();
        assert_eq!(unwrap_dek(&KEY, &wrapped, b"slot").unwrap(), dek);

        let wrong_kek = [1u8; 32];
        assert!(unwrap_dek(&wrong_kek, &wrapped, b"slot").is_err());
    }
}
