//! Crash-safe file write helpers.
//!
//! Every persisted artifact goes through write-temp-then-rename: a crash
//! mid-write leaves a stray temp file, never a half-written artifact at the
//! final path.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use uuid::Uuid;

use crate::error::KeeperError;

/// Write `bytes` to `dest` atomically. The temp file is a sibling of the
/// destination so the final rename stays on one filesystem.
pub fn write_atomic(dest: &Path, bytes: &[u8]) -> Result<(), KeeperError> {
    let parent = dest
        .parent()
        .ok_or_else(|| KeeperError::Internal(format!("no parent dir for {}", dest.display())))?;
    fs::create_dir_all(parent)?;

    let file_name = dest
        .file_name()
        .ok_or_else(|| KeeperError::Internal(format!("no file name in {}", dest.display())))?
        .to_string_lossy()
        .into_owned();
    let tmp = parent.join(format!(".{file_name}.tmp-{}", Uuid::new_v4()));

    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    if let Err(e) = fs::rename(&tmp, dest) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    fsync_dir(parent)?;
    Ok(())
}

pub fn fsync_dir(path: &Path) -> Result<(), KeeperError> {
    #[cfg(unix)]
    {
        let dir = OpenOptions::new().read(true).open(path)?;
        dir.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_atomic_replaces_existing_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("artifact.bin");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");

        // no stray temp files left behind
        let strays: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(strays.is_empty());
    }
}
