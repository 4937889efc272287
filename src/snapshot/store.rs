//! Snapshot directory management
//!
//! Owns the canonical snapshot path, the uniquely named temporaries that
//! precede each rename, and the checkpoint files.
//!
//! ```text
//! {snapshot_dir}/
//!   ├── state.snapshot                        canonical, replaced by rename only
//!   ├── state.snapshot.tmp.<lsn hex>          one per in-flight publication
//!   ├── checkpoint-<lsn hex>-<ms>.snapshot    last known-good copy
//!   └── checkpoint.meta                       JSON: digest, lsn, created_at_ms, body
//! ```
//!
//! A checkpoint is published by renaming `checkpoint.meta` alone. The body it
//! names is already durable under its own name, so an interrupted checkpoint
//! leaves the previous one intact.

use std::ffi::OsStr;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::config::SyncMode;
use crate::durability::{rename_atomic, sync_file, write_synced};
use crate::error::{Result, StateError};
use crate::wal::now_millis;

use super::{Digest, SnapshotImage};

/// Metadata stored next to the checkpoint file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// Digest of the checkpoint body
    pub digest: Digest,

    /// Last WAL LSN covered by the checkpoint
    pub lsn: u64,

    /// Unix millis when the checkpoint was taken
    pub created_at_ms: u64,

    /// File name of the body inside the snapshot directory
    pub body: String,
}

/// A checkpoint as found on disk
#[derive(Debug)]
pub struct StoredCheckpoint {
    pub meta: CheckpointMeta,

    /// Path of the body file
    pub path: PathBuf,

    pub image: SnapshotImage,
}

/// A temporary snapshot file that has been written but not yet renamed
pub struct TempSnapshot {
    path: PathBuf,
    file: File,
}

impl TempSnapshot {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durable-flush the temporary file
    pub fn sync(&self, mode: SyncMode) -> Result<()> {
        sync_file(&self.file, mode, &self.path)
    }
}

/// Manages the snapshot directory
pub struct SnapshotStore {
    dir: PathBuf,
    sync_mode: SyncMode,
}

impl SnapshotStore {
    // =========================================================================
    // Internal Path Constants
    // =========================================================================
    const CANONICAL: &'static str = "state.snapshot";
    const TEMP_PREFIX: &'static str = "state.snapshot.tmp.";
    const REJECTED_PREFIX: &'static str = "state.snapshot.rejected-";
    const CHECKPOINT_PREFIX: &'static str = "checkpoint-";
    const CHECKPOINT_SUFFIX: &'static str = ".snapshot";
    const CHECKPOINT_META: &'static str = "checkpoint.meta";

    /// Open (and create) the snapshot directory
    pub fn open(dir: &Path, sync_mode: SyncMode) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            sync_mode,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn canonical_path(&self) -> PathBuf {
        self.dir.join(Self::CANONICAL)
    }

    /// Temporary path for the publication prepared at `lsn`
    pub fn temp_path(&self, lsn: u64) -> PathBuf {
        self.dir.join(format!("{}{:016x}", Self::TEMP_PREFIX, lsn))
    }

    pub fn checkpoint_meta_path(&self) -> PathBuf {
        self.dir.join(Self::CHECKPOINT_META)
    }

    // =========================================================================
    // Publication
    // =========================================================================

    /// Write snapshot bytes to the temporary file for `lsn` (not yet flushed)
    pub fn create_temp(&self, lsn: u64, bytes: &[u8]) -> Result<TempSnapshot> {
        let path = self.temp_path(lsn);
        let write_failure = |source| StateError::DurableWriteFailure {
            path: path.clone(),
            source,
        };

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(write_failure)?;
        file.write_all(bytes).map_err(write_failure)?;

        Ok(TempSnapshot { path, file })
    }

    /// Atomically rename a flushed temporary over the canonical file
    pub fn publish(&self, temp: &TempSnapshot) -> Result<()> {
        rename_atomic(&temp.path, &self.canonical_path())
    }

    /// Write, flush and publish in one step (used outside the commit path)
    pub fn install(&self, lsn: u64, bytes: &[u8]) -> Result<()> {
        let temp = self.create_temp(lsn, bytes)?;
        let result = temp.sync(self.sync_mode).and_then(|_| self.publish(&temp));
        if result.is_err() {
            let _ = self.remove_temp(temp.path());
        }
        result
    }

    /// Read the canonical file, `None` if it does not exist
    pub fn read_canonical(&self) -> Result<Option<Bytes>> {
        read_optional(&self.canonical_path())
    }

    /// Move the canonical file aside for inspection
    pub fn reject_canonical(&self) -> Result<Option<PathBuf>> {
        let canonical = self.canonical_path();
        if !canonical.exists() {
            return Ok(None);
        }
        let aside = self
            .dir
            .join(format!("{}{}", Self::REJECTED_PREFIX, now_millis()));
        rename_atomic(&canonical, &aside)?;
        Ok(Some(aside))
    }

    // =========================================================================
    // Temporaries
    // =========================================================================

    /// Remove a temporary file; returns whether one existed
    pub fn remove_temp(&self, path: &Path) -> Result<bool> {
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// All temporaries currently in the directory
    pub fn temp_files(&self) -> Result<Vec<PathBuf>> {
        let mut temps = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_temp = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(Self::TEMP_PREFIX))
                .unwrap_or(false);
            if is_temp && path.is_file() {
                temps.push(path);
            }
        }
        temps.sort();
        Ok(temps)
    }

    // =========================================================================
    // Checkpoint
    // =========================================================================

    /// Persist a checkpoint of `bytes` (digest `digest`, covering WAL up to
    /// `lsn`) and return the metadata that now vouches for it.
    ///
    /// The body is written under a fresh name, then the metadata is renamed
    /// into place. Older bodies are removed only after that rename.
    pub fn write_checkpoint(&self, bytes: &[u8], digest: Digest, lsn: u64) -> Result<CheckpointMeta> {
        let created_at_ms = now_millis();
        let body = format!(
            "{}{:016x}-{}{}",
            Self::CHECKPOINT_PREFIX,
            lsn,
            created_at_ms,
            Self::CHECKPOINT_SUFFIX
        );
        let meta = CheckpointMeta {
            digest,
            lsn,
            created_at_ms,
            body,
        };

        let body_path = self.dir.join(&meta.body);
        let body_tmp = self.dir.join(format!("{}.tmp", meta.body));
        write_synced(&body_tmp, bytes, self.sync_mode)?;
        rename_atomic(&body_tmp, &body_path)?;

        let meta_tmp = self.dir.join(format!("{}.tmp", Self::CHECKPOINT_META));
        let json = serde_json::to_vec_pretty(&meta)?;
        write_synced(&meta_tmp, &json, self.sync_mode)?;
        rename_atomic(&meta_tmp, &self.checkpoint_meta_path())?;

        for stale in self.checkpoint_bodies()? {
            if stale != body_path {
                if let Err(e) = fs::remove_file(&stale) {
                    tracing::warn!(path = %stale.display(), error = %e, "could not remove old checkpoint");
                }
            }
        }
        Ok(meta)
    }

    /// Load the checkpoint the metadata names, `None` when no checkpoint was
    /// ever taken
    pub fn read_checkpoint(&self) -> Result<Option<StoredCheckpoint>> {
        let meta_path = self.checkpoint_meta_path();
        let meta_bytes = match read_optional(&meta_path)? {
            Some(b) => b,
            None => return Ok(None),
        };
        let meta: CheckpointMeta = serde_json::from_slice(&meta_bytes)?;

        let is_plain_name = Path::new(&meta.body).file_name() == Some(OsStr::new(&meta.body));
        if !is_plain_name || !meta.body.starts_with(Self::CHECKPOINT_PREFIX) {
            return Err(StateError::StateCorruption {
                path: meta_path,
                detail: format!("checkpoint metadata names an invalid body {:?}", meta.body),
            });
        }

        let path = self.dir.join(&meta.body);
        let body = read_optional(&path)?.ok_or_else(|| StateError::StateCorruption {
            path: path.clone(),
            detail: "checkpoint metadata exists but the checkpoint file is missing".into(),
        })?;
        let image = SnapshotImage::parse(&path, body)?;
        Ok(Some(StoredCheckpoint { meta, path, image }))
    }

    /// Every checkpoint body in the directory, named or not
    fn checkpoint_bodies(&self) -> Result<Vec<PathBuf>> {
        let mut bodies = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_body = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(Self::CHECKPOINT_PREFIX) && n.ends_with(Self::CHECKPOINT_SUFFIX))
                .unwrap_or(false);
            if is_body {
                bodies.push(path);
            }
        }
        Ok(bodies)
    }
}

fn read_optional(path: &Path) -> Result<Option<Bytes>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(Bytes::from(bytes))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
