//! In-memory unlocked session.
//!
//! A session owns the open store, and with it the only copy of the DEK.
//! There is no ambient singleton: the host receives the session from
//! `unlock`/`migrate`/`recover_with`, passes it by reference to whoever
//! needs data access, and ends it with `lock` (or by dropping it). The key
//! is zeroized either way.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

use crate::error::KeeperError;
use crate::store::EncryptedStore;

pub struct Session {
    store: EncryptedStore,
    unlocked_at: DateTime<Utc>,
    // counted by the facade to answer "is the store currently unlocked"
    _liveness: Arc<()>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Session({})", self.store.store_id())
    }
}

impl Session {
    pub(crate) fn new(store: EncryptedStore, liveness: Arc<()>) -> Self {
        Self {
            store,
            unlocked_at: Utc::now(),
            _liveness: liveness,
        }
    }

    /// Identity of the store this session has open.
    pub fn store_id(&self) -> &str {
        self.store.store_id()
    }

    pub fn unlocked_at(&self) -> DateTime<Utc> {
        self.unlocked_at
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.store.tables().keys().map(String::as_str).collect()
    }

    pub fn rows(&self, table: &str) -> Option<&[serde_json::Value]> {
        self.store.rows(table)
    }

    pub fn row_count(&self, table: &str) -> u64 {
        self.store.rows(table).map_or(0, |rows| rows.len() as u64)
    }

    /// Append a row and persist immediately.
    pub fn insert_row(&mut self, table: &str, row: serde_json::Value) -> Result<(), KeeperError> {
        self.store.insert_row(table, row);
        self.store.save()
    }

    /// Replace a table wholesale and persist immediately.
    pub fn replace_table(
        &mut self,
        table: &str,
        rows: Vec<serde_json::Value>,
    ) -> Result<(), KeeperError> {
        self.store.replace_table(table, rows);
        self.store.save()
    }

    /// End the session. Consumes the handle; the key material is zeroized.
    pub fn lock(self) {
        info!(store_id = %self.store.store_id(), "session locked");
        // drop does the rest
    }

    pub(crate) fn store(&self) -> &EncryptedStore {
        &self.store
    }

    pub(crate) fn store_mut(&mut self) -> &mut EncryptedStore {
        &mut self.store
    }
}
