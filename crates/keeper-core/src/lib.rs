//! keeper-core — encrypted local storage for Draftsmith
//!
//! # What lives here
//! The key-management and migration engine behind the application's local
//! database: deriving and holding the key that protects the store,
//! generating and validating the recovery credential, converting the legacy
//! plaintext store into the encrypted container exactly once, and snapshot /
//! restore around every destructive operation.
//!
//! # Encryption strategy
//! The container payload is encrypted under a random 32-byte DEK. The DEK is
//! wrapped twice: under the Argon2id passphrase-derived key and, once
//! recovery is configured, under a key derived from the recovery credential.
//! Either wrap alone unlocks the store, which is what makes recovery
//! independent of a forgotten passphrase and passphrase rotation a
//! header-only rewrite.
//!
//! # Module layout
//! - `keeper`         — host-facing facade (`Keeper`, `StoreStatus`)
//! - `session`        — the single in-memory unlocked session
//! - `migration`      — probe + staged convert/verify/commit with rollback
//! - `recovery`       — recovery credential lifecycle
//! - `backup`         — timestamped, integrity-checked snapshots
//! - `store`          — the encrypted container format and key slots
//! - `legacy`         — reader for the pre-migration plaintext store
//! - `secure_storage` — OS credential-store seam (opt-in auto-unlock)
//! - `salt`           — the create-once store salt file
//! - `lockfile`       — migration/rotation exclusivity marker
//! - `layout`         — where everything lives on disk
//! - `fsutil`         — write-temp-then-rename helpers
//! - `error`          — the `KeeperError` taxonomy

pub mod backup;
pub mod error;
pub mod fsutil;
pub mod keeper;
pub mod layout;
pub mod legacy;
pub mod lockfile;
pub mod migration;
pub mod recovery;
pub mod salt;
pub mod secure_storage;
pub mod session;
pub mod store;

pub use backup::{BackupHandle, BackupManager, BackupManifest, PrunePolicy};
pub use error::KeeperError;
pub use keeper::{Keeper, StoreStatus};
pub use layout::StoreLayout;
pub use migration::{MigrationProgress, MigrationStage, MigrationState};
pub use recovery::RecoveryCredential;
pub use secure_storage::{KeyringSecretStore, MemorySecretStore, SecretStore, SecretStoreError};
pub use session::Session;
pub use store::{EncryptedStore, EncryptionMetadata};
