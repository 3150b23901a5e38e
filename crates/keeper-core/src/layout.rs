//! Filesystem layout of a keeper store directory.
//!
//! Everything the keeper persists lives under one root: the salt file, the
//! legacy plaintext store at its historical path, the encrypted container,
//! the backups directory and the migration lock. Hosts point at a custom
//! root with [`StoreLayout::at`]; `discover` resolves the platform default.

use directories::ProjectDirs;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::KeeperError;

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "draftsmith";
pub const APP_NAME: &str = "keeper";

const SALT_FILE: &str = "keeper.salt";
const LEGACY_STORE_FILE: &str = "store.json";
const ENCRYPTED_STORE_FILE: &str = "store.keeper";
const PARTIAL_STORE_FILE: &str = "store.keeper.partial";
const BACKUPS_DIR: &str = "backups";
const MIGRATION_LOCK_FILE: &str = "migration.lock";

#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    /// Resolve the platform data directory for the application.
    pub fn discover() -> Result<Self, KeeperError> {
        let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
            .ok_or_else(|| KeeperError::Internal("cannot determine data directory".into()))?;
        Ok(Self::at(dirs.data_dir()))
    }

    pub fn at(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Base64 text of the store salt; readable before the store can be opened.
    pub fn salt_path(&self) -> PathBuf {
        self.root.join(SALT_FILE)
    }

    /// The pre-migration plaintext store at its historical path.
    pub fn legacy_store_path(&self) -> PathBuf {
        self.root.join(LEGACY_STORE_FILE)
    }

    /// The encrypted container. Migration never writes here directly; the
    /// partial path is promoted by rename once verified.
    pub fn encrypted_store_path(&self) -> PathBuf {
        self.root.join(ENCRYPTED_STORE_FILE)
    }

    /// In-flight migration target, promoted to `encrypted_store_path` on commit.
    pub fn partial_store_path(&self) -> PathBuf {
        self.root.join(PARTIAL_STORE_FILE)
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join(BACKUPS_DIR)
    }

    pub fn migration_lock_path(&self) -> PathBuf {
        self.root.join(MIGRATION_LOCK_FILE)
    }

    pub fn ensure_root(&self) -> Result<(), KeeperError> {
        fs::create_dir_all(&self.root)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_hang_off_the_root() {
        let layout = StoreLayout::at("/data/keeper");
        assert_eq!(layout.salt_path(), Path::new("/data/keeper/keeper.salt"));
        assert_eq!(
            layout.partial_store_path(),
            Path::new("/data/keeper/store.keeper.partial")
        );
        assert_eq!(layout.backups_dir(), Path::new("/data/keeper/backups"));
    }
}
