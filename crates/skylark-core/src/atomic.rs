//! Whole-file replacement of small JSON state files.
//!
//! Readers poll these files from other processes, so a write is staged in a
//! temp file next to the target, synced, and renamed over it.

use std::io::Write;
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{CoreError, Result};

pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| CoreError::io(dir, e))?;

    let bytes = serde_json::to_vec(value).map_err(|source| CoreError::Malformed {
        path: path.to_path_buf(),
        source,
    })?;

    let mut staged = tempfile::NamedTempFile::new_in(dir).map_err(|e| CoreError::io(dir, e))?;
    staged
        .as_file_mut()
        .write_all(&bytes)
        .map_err(|e| CoreError::io(staged.path(), e))?;
    staged
        .as_file()
        .sync_all()
        .map_err(|e| CoreError::io(staged.path(), e))?;
    staged
        .persist(path)
        .map_err(|e| CoreError::io(path, e.error))?;
    Ok(())
}

/// `Ok(None)` when the file does not exist.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let text = match std::fs::read(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CoreError::io(path, e)),
    };
    serde_json::from_slice(&text)
        .map(Some)
        .map_err(|source| CoreError::Malformed {
            path: path.to_path_buf(),
            source,
        })
}
