//! keeper-crypto — cryptographic primitives for the Draftsmith keeper
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - Key material crosses module boundaries as opaque newtypes.
//!
//! # Module layout
//! - `kdf`   — Argon2id passphrase/credential derivation + credential hashing
//! - `aead`  — XChaCha20-Poly1305 encrypt/decrypt and DEK wrap/unwrap
//! - `hash`  — BLAKE3 content digests
//! - `error` — unified error type

pub mod aead;
pub mod error;
pub mod hash;
pub mod kdf;

pub use error::CryptoError;
