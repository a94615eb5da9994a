//! Filesystem helpers.
//!
//! The engine touches the filesystem in a small number of well-defined ways:
//! creating the version/serving directories, landing downloaded assets, and
//! persisting the version store. Writes that must never be observed half-done
//! go through [`atomic_write`] (temp file + rename).

use crate::core::{HotPushError, Result};
use std::fs;
use std::io::Write;
use std::path::Path;

/// Creates a directory (and parents) if it does not already exist.
///
/// Fails if the path exists but is not a directory.
pub fn ensure_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path).map_err(|e| HotPushError::io(path, e))?;
    } else if !path.is_dir() {
        return Err(HotPushError::io(
            path,
            std::io::Error::other("path exists but is not a directory"),
        ));
    }
    Ok(())
}

/// Writes `content` to `path` atomically.
///
/// The bytes are written to a sibling temp file, synced, and renamed into
/// place, so the target either has the old content or the new content, never
/// a partial write. Parent directories are created as needed.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }

    // Appended, not substituted: `app.js` and `app.css` landing concurrently
    // in one directory must not share a temp file.
    let mut temp_name = path.file_name().map(std::ffi::OsString::from).unwrap_or_default();
    temp_name.push(".tmp");
    let temp_path = path.with_file_name(temp_name);
    {
        let mut file =
            fs::File::create(&temp_path).map_err(|e| HotPushError::io(&temp_path, e))?;
        file.write_all(content).map_err(|e| HotPushError::io(&temp_path, e))?;
        file.sync_all().map_err(|e| HotPushError::io(&temp_path, e))?;
    }

    fs::rename(&temp_path, path).map_err(|e| HotPushError::io(path, e))?;
    Ok(())
}

/// Removes a directory tree if it exists; a missing directory is not an error.
pub fn remove_dir_if_exists(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_dir_all(path).map_err(|e| HotPushError::io(path, e))?;
    }
    Ok(())
}
