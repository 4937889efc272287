//! Durable-flush and atomic-rename primitives
//!
//! Every durable-flush point in the crate goes through [`sync_file`], every
//! publication through [`rename_atomic`]. Small whole-file writes that are
//! renamed into place afterwards use [`write_synced`].
//!
//! ## Guarantee
//! - `SyncMode::Full` calls `sync_all` (fsync / FlushFileBuffers): data plus all
//!   metadata.
//! - `SyncMode::Data` calls `sync_data` (fdatasync on Linux, `F_FULLFSYNC`-free
//!   fsync on macOS, FlushFileBuffers on Windows): data plus the metadata needed
//!   to read it back. On macOS neither mode forces the drive cache; callers that
//!   need that must run on hardware with power-loss protection.
//! - After a rename the parent directory is fsynced on Unix so the new directory
//!   entry survives power loss. Windows has no directory fsync; NTFS journals the
//!   rename itself.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use crate::config::SyncMode;
use crate::error::{Result, StateError};

/// Force a file's contents to stable storage.
pub fn sync_file(file: &File, mode: SyncMode, path: &Path) -> Result<()> {
    let synced = match mode {
        SyncMode::Full => file.sync_all(),
        SyncMode::Data => file.sync_data(),
    };
    synced.map_err(|source| StateError::DurableWriteFailure {
        path: path.to_path_buf(),
        source,
    })
}

/// Create `path` with `bytes` and flush it before returning.
pub fn write_synced(path: &Path, bytes: &[u8], mode: SyncMode) -> Result<()> {
    let write_failure = |source| StateError::DurableWriteFailure {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::create(path).map_err(write_failure)?;
    file.write_all(bytes).map_err(write_failure)?;
    sync_file(&file, mode, path)
}

/// Force a directory's entries to stable storage.
#[cfg(unix)]
pub fn sync_dir(dir: &Path) -> Result<()> {
    let handle = File::open(dir)?;
    handle
        .sync_all()
        .map_err(|source| StateError::DurableWriteFailure {
            path: dir.to_path_buf(),
            source,
        })
}

#[cfg(not(unix))]
pub fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

/// Rename `from` over `to`, retrying once, then fsync the parent directory.
///
/// Both paths must be in the same directory.
pub fn rename_atomic(from: &Path, to: &Path) -> Result<()> {
    if let Err(first) = fs::rename(from, to) {
        tracing::warn!(
            from = %from.display(),
            to = %to.display(),
            error = %first,
            "rename failed, retrying once"
        );
        fs::rename(from, to).map_err(|source| StateError::RenameFailure {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
            source,
        })?;
    }

    if let Some(parent) = to.parent() {
        sync_dir(parent)?;
    }
    Ok(())
}
