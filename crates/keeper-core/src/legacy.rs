//! Reader for the pre-encryption document store.
//!
//! The legacy application kept everything in a single plaintext JSON
//! document: a top-level `tables` object mapping table name to an array of
//! row objects. Migration reads it; nothing here ever writes to it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::KeeperError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LegacyStore {
    #[serde(default)]
    pub tables: BTreeMap<String, Vec<serde_json::Value>>,
}

impl LegacyStore {
    pub fn load(path: &Path) -> Result<Self, KeeperError> {
        let raw = fs::read(path)
            .map_err(|e| KeeperError::StoreInconsistent(format!("read legacy store: {e}")))?;
        serde_json::from_slice(&raw)
            .map_err(|e| KeeperError::StoreInconsistent(format!("parse legacy store: {e}")))
    }

    pub fn row_counts(&self) -> BTreeMap<String, u64> {
        self.tables
            .iter()
            .map(|(name, rows)| (name.clone(), rows.len() as u64))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_and_count_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        fs::write(
            &path,
            r#"{"tables":{"proposals":[{"id":1},{"id":2}],"settings":[{"theme":"dark"}]}}"#,
        )
        .unwrap();
        let store = LegacyStore::load(&path).unwrap();
        let counts = store.row_counts();
        assert_eq!(counts["proposals"], 2);
        assert_eq!(counts["settings"], 1);
    }

    #[test]
    fn malformed_document_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        fs::write(&path, b"{not json").unwrap();
        assert!(matches!(
            LegacyStore::load(&path),
            Err(KeeperError::StoreInconsistent(_))
        ));
    }
}
