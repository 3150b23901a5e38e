//! The encrypted container backing the post-migration store.
//!
//! On-disk layout:
//!   [ magic (8 bytes) | u32 LE header length | header JSON | nonce || ciphertext+tag ]
//!
//! The header is plaintext and carries the key slots: the payload key (DEK)
//! wrapped under the passphrase-derived KEK and, once recovery is set up,
//! under the recovery-derived KEK. The payload holds the application tables
//! plus the `EncryptionMetadata` singleton and is AEAD-encrypted under the
//! DEK with the store id as associated data, so a header transplanted from
//! another store fails authentication.

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use uuid::Uuid;
use zeroize::Zeroizing;

use keeper_crypto::kdf::{self, DerivedKey};
use keeper_crypto::{aead, CryptoError};

use crate::error::KeeperError;
use crate::fsutil;

pub const STORE_MAGIC: &[u8] = b"DSKEEP1\0";
pub const STORE_VERSION: u32 = 1;

/// Fixed identity of the metadata singleton row.
pub const METADATA_ROW_ID: u32 = 1;

const MAX_HEADER_LEN: usize = 64 * 1024;

const PAYLOAD_AAD_PREFIX: &str = "keeper-store-v1:";
pub(crate) const PASSPHRASE_SLOT_AAD: &[u8] = b"keeper-slot:passphrase";
pub(crate) const RECOVERY_SLOT_AAD: &[u8] = b"keeper-slot:recovery";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverySlot {
    /// Base64 salt for deriving the recovery KEK from the credential.
    pub salt: String,
    /// Base64 wrapped DEK (AEAD wire format).
    pub wrapped_dek: String,
    /// PHC hash of the credential; mirrors the metadata row so candidates
    /// can be verified while the store is locked.
    pub credential_hash: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreHeader {
    pub version: u32,
    pub store_id: String,
    pub created_at: DateTime<Utc>,
    pub kdf_time_cost: u32,
    pub kdf_memory_cost: u32,
    pub kdf_parallelism: u32,
    /// Base64 DEK wrapped under the passphrase KEK.
    pub passphrase_slot: String,
    pub recovery_slot: Option<RecoverySlot>,
}

/// Singleton record inside the encrypted payload. Exactly one exists once
/// the store is initialised; `id` is constrained to [`METADATA_ROW_ID`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionMetadata {
    pub id: u32,
    pub recovery_key_encrypted: Option<String>,
    pub recovery_key_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorePayload {
    pub metadata: EncryptionMetadata,
    #[serde(default)]
    pub tables: BTreeMap<String, Vec<serde_json::Value>>,
}

pub struct EncryptedStore {
    header: StoreHeader,
    payload: StorePayload,
    path: PathBuf,
    dek: Zeroizing<[u8; 32]>,
}

impl std::fmt::Debug for EncryptedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncryptedStore({})", self.header.store_id)
    }
}

impl EncryptedStore {
    /// Create a fresh container at `path`: generates the DEK, wraps it under
    /// `kek` and writes atomically. Refuses to overwrite an existing file.
    pub fn create_at(
        path: &Path,
        kek: &DerivedKey,
        tables: BTreeMap<String, Vec<serde_json::Value>>,
    ) -> Result<Self, KeeperError> {
        if path.exists() {
            return Err(KeeperError::Internal(format!(
                "store already exists at {}",
                path.display()
            )));
        }

        let mut dek = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut *dek);
        let wrapped = aead::wrap_dek(&kek.0, &dek, PASSPHRASE_SLOT_AAD)?;

        let now = Utc::now();
        let header = StoreHeader {
            version: STORE_VERSION,
            store_id: Uuid::new_v4().to_string(),
            created_at: now,
            kdf_time_cost: kdf::KDF_TIME_COST,
            kdf_memory_cost: kdf::KDF_MEMORY_COST,
            kdf_parallelism: kdf::KDF_PARALLELISM,
            passphrase_slot: general_purpose::STANDARD.encode(wrapped),
            recovery_slot: None,
        };
        let payload = StorePayload {
            metadata: EncryptionMetadata {
                id: METADATA_ROW_ID,
                recovery_key_encrypted: None,
                recovery_key_hash: None,
                created_at: now,
                updated_at: now,
            },
            tables,
        };

        let mut store = Self {
            header,
            payload,
            path: path.to_path_buf(),
            dek,
        };
        store.save()?;
        Ok(store)
    }

    /// Parse just the plaintext header. Doubles as the structural probe used
    /// for migration-state detection; no key required.
    pub fn read_header(path: &Path) -> Result<StoreHeader, KeeperError> {
        let mut file = File::open(path)
            .map_err(|e| KeeperError::StoreInconsistent(format!("open store: {e}")))?;
        Self::read_header_from(&mut file)
    }

    fn read_header_from(file: &mut File) -> Result<StoreHeader, KeeperError> {
        let mut magic = [0u8; 8];
        file.read_exact(&mut magic)
            .map_err(|e| KeeperError::StoreInconsistent(format!("read store magic: {e}")))?;
        if magic != STORE_MAGIC {
            return Err(KeeperError::StoreInconsistent("bad store magic".into()));
        }
        let mut len_buf = [0u8; 4];
        file.read_exact(&mut len_buf)
            .map_err(|e| KeeperError::StoreInconsistent(format!("read header length: {e}")))?;
        let header_len = u32::from_le_bytes(len_buf) as usize;
        if header_len == 0 || header_len > MAX_HEADER_LEN {
            return Err(KeeperError::StoreInconsistent(format!(
                "implausible header length {header_len}"
            )));
        }
        let mut header_buf = vec![0u8; header_len];
        file.read_exact(&mut header_buf)
            .map_err(|e| KeeperError::StoreInconsistent(format!("read store header: {e}")))?;
        let header: StoreHeader = serde_json::from_slice(&header_buf)
            .map_err(|e| KeeperError::StoreInconsistent(format!("parse store header: {e}")))?;
        if header.version != STORE_VERSION {
            return Err(KeeperError::StoreInconsistent(format!(
                "unsupported store version {}",
                header.version
            )));
        }
        Ok(header)
    }

    /// Unwrap the passphrase slot with a derived KEK. Failure means a wrong
    /// passphrase or a tampered slot; the caller decides which error applies.
    pub fn unwrap_passphrase_slot(
        header: &StoreHeader,
        kek: &DerivedKey,
    ) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let wrapped = general_purpose::STANDARD
            .decode(&header.passphrase_slot)
            .map_err(|e| CryptoError::InvalidKey(format!("decode passphrase slot: {e}")))?;
        aead::unwrap_dek(&kek.0, &wrapped, PASSPHRASE_SLOT_AAD).map(Zeroizing::new)
    }

    /// Unwrap the recovery slot with a credential-derived KEK.
    pub fn unwrap_recovery_slot(
        slot: &RecoverySlot,
        kek: &DerivedKey,
    ) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let wrapped = general_purpose::STANDARD
            .decode(&slot.wrapped_dek)
            .map_err(|e| CryptoError::InvalidKey(format!("decode recovery slot: {e}")))?;
        aead::unwrap_dek(&kek.0, &wrapped, RECOVERY_SLOT_AAD).map(Zeroizing::new)
    }

    /// Open the container with the raw DEK and canary-read the metadata
    /// singleton before handing the store out.
    pub fn open_with_dek(path: &Path, dek: Zeroizing<[u8; 32]>) -> Result<Self, KeeperError> {
        let mut file = File::open(path)
            .map_err(|e| KeeperError::StoreInconsistent(format!("open store: {e}")))?;
        let header = Self::read_header_from(&mut file)?;
        let mut ciphertext = Vec::new();
        file.read_to_end(&mut ciphertext)
            .map_err(|e| KeeperError::StoreInconsistent(format!("read store payload: {e}")))?;

        let plaintext = aead::decrypt(&dek, &ciphertext, &payload_aad(&header.store_id))
            .map_err(|_| KeeperError::StoreInconsistent("payload decryption failed".into()))?;
        let payload: StorePayload = serde_json::from_slice(&plaintext)
            .map_err(|e| KeeperError::StoreInconsistent(format!("parse store payload: {e}")))?;

        if payload.metadata.id != METADATA_ROW_ID {
            return Err(KeeperError::MetadataCorrupted);
        }

        Ok(Self {
            header,
            payload,
            path: path.to_path_buf(),
            dek,
        })
    }

    /// Atomic rewrite of the whole container. A fresh payload nonce is drawn
    /// on every save; reusing one would break the AEAD.
    pub fn save(&mut self) -> Result<(), KeeperError> {
        let header_json = serde_json::to_vec(&self.header)?;
        if header_json.len() > MAX_HEADER_LEN {
            return Err(KeeperError::Internal("store header too large".into()));
        }
        let plaintext = Zeroizing::new(serde_json::to_vec(&self.payload)?);
        let ciphertext = aead::encrypt(&self.dek, &plaintext, &payload_aad(&self.header.store_id))?;

        let mut out = Vec::with_capacity(12 + header_json.len() + ciphertext.len());
        out.extend_from_slice(STORE_MAGIC);
        out.extend_from_slice(&(header_json.len() as u32).to_le_bytes());
        out.extend_from_slice(&header_json);
        out.extend_from_slice(&ciphertext);

        fsutil::write_atomic(&self.path, &out)
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    pub fn store_id(&self) -> &str {
        &self.header.store_id
    }

    pub fn header(&self) -> &StoreHeader {
        &self.header
    }

    pub fn metadata(&self) -> &EncryptionMetadata {
        &self.payload.metadata
    }

    pub fn tables(&self) -> &BTreeMap<String, Vec<serde_json::Value>> {
        &self.payload.tables
    }

    pub fn rows(&self, table: &str) -> Option<&[serde_json::Value]> {
        self.payload.tables.get(table).map(Vec::as_slice)
    }

    pub fn row_counts(&self) -> BTreeMap<String, u64> {
        self.payload
            .tables
            .iter()
            .map(|(name, rows)| (name.clone(), rows.len() as u64))
            .collect()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn dek(&self) -> &[u8; 32] {
        &self.dek
    }

    pub(crate) fn metadata_mut(&mut self) -> &mut EncryptionMetadata {
        &mut self.payload.metadata
    }

    pub(crate) fn insert_row(&mut self, table: &str, row: serde_json::Value) {
        self.payload
            .tables
            .entry(table.to_string())
            .or_default()
            .push(row);
    }

    pub(crate) fn replace_table(&mut self, table: &str, rows: Vec<serde_json::Value>) {
        self.payload.tables.insert(table.to_string(), rows);
    }

    pub(crate) fn set_recovery_slot(&mut self, slot: RecoverySlot) {
        self.header.recovery_slot = Some(slot);
    }

    /// Re-wrap the DEK under a new passphrase KEK (passphrase rotation).
    /// Header-only mutation; the payload is untouched.
    pub(crate) fn rewrap_passphrase_slot(&mut self, kek: &DerivedKey) -> Result<(), KeeperError> {
        let wrapped = aead::wrap_dek(&kek.0, &self.dek, PASSPHRASE_SLOT_AAD)?;
        self.header.passphrase_slot = general_purpose::STANDARD.encode(wrapped);
        Ok(())
    }

    /// Update the in-memory location after the file was renamed into place.
    pub(crate) fn relocate(&mut self, path: &Path) {
        self.path = path.to_path_buf();
    }
}

fn payload_aad(store_id: &str) -> Vec<u8> {
    format!("{PAYLOAD_AAD_PREFIX}{store_id}").into_bytes()
}
