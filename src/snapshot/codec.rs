//! Snapshot file encoding
//!
//! ```text
//! ┌───────────┬─────────────┬──────────────┬──────────────┬──────────────────┐
//! │ Magic (4) │ Version (2) │ Digest (32)  │ Body len (8) │ Body (bincode)   │
//! └───────────┴─────────────┴──────────────┴──────────────┴──────────────────┘
//! ```
//!
//! The body is the bincode encoding of the ordered key/value index, so equal
//! states always encode to equal bytes and equal digests. The digest in the
//! header is SHA-256 of the body.

use std::path::Path;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, StateError};
use crate::memtable::State;

use super::Digest;

/// File magic: "SCSN"
pub const MAGIC: &[u8; 4] = b"SCSN";

/// Format version
pub const VERSION: u16 = 1;

/// Bytes before the body
pub const HEADER_SIZE: usize = 4 + 2 + 32 + 8;

/// A fully encoded snapshot, ready to be written
#[derive(Debug, Clone)]
pub struct EncodedSnapshot {
    pub digest: Digest,
    pub bytes: Bytes,
}

/// Encode a state into snapshot file bytes
pub fn encode_state(state: &State) -> Result<EncodedSnapshot> {
    let body = bincode::serialize(state)?;
    let digest = Digest::of(&body);

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len());
    buf.put_slice(MAGIC);
    buf.put_u16_le(VERSION);
    buf.put_slice(digest.as_bytes());
    buf.put_u64_le(body.len() as u64);
    buf.put_slice(&body);

    Ok(EncodedSnapshot {
        digest,
        bytes: buf.freeze(),
    })
}

/// Digest of a state without keeping the encoding
pub fn state_digest(state: &State) -> Result<Digest> {
    Ok(encode_state(state)?.digest)
}

/// A snapshot file read back from disk, not yet trusted.
///
/// `recorded` is what the header claims, `computed` is what the body hashes
/// to. Decoding the body is a separate step so a digest check can run first.
#[derive(Debug, Clone)]
pub struct SnapshotImage {
    pub recorded: Digest,
    pub computed: Digest,
    body: Bytes,
}

impl SnapshotImage {
    /// Parse the header and hash the body.
    ///
    /// Fails with `StateCorruption` when the header is unreadable or the body
    /// length disagrees with the file length.
    pub fn parse(path: &Path, bytes: Bytes) -> Result<Self> {
        let corrupt = |detail: String| StateError::StateCorruption {
            path: path.to_path_buf(),
            detail,
        };

        if bytes.len() < HEADER_SIZE {
            return Err(corrupt(format!(
                "snapshot is {} bytes, shorter than its {} byte header",
                bytes.len(),
                HEADER_SIZE
            )));
        }
        if &bytes[0..4] != MAGIC {
            return Err(corrupt("bad snapshot magic".to_string()));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != VERSION {
            return Err(corrupt(format!("unsupported snapshot version {}", version)));
        }

        let mut recorded = [0u8; 32];
        recorded.copy_from_slice(&bytes[6..38]);

        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&bytes[38..46]);
        let body_len = u64::from_le_bytes(len_bytes) as usize;
        if body_len != bytes.len() - HEADER_SIZE {
            return Err(corrupt(format!(
                "body length {} does not match file ({} bytes after header)",
                body_len,
                bytes.len() - HEADER_SIZE
            )));
        }

        let body = bytes.slice(HEADER_SIZE..);
        Ok(Self {
            recorded: Digest::from_bytes(recorded),
            computed: Digest::of(&body),
            body,
        })
    }

    /// Header and body agree
    pub fn is_self_consistent(&self) -> bool {
        self.recorded == self.computed
    }

    /// Header and body agree with an externally recorded digest
    pub fn matches(&self, expected: &Digest) -> bool {
        self.is_self_consistent() && &self.computed == expected
    }

    /// Decode the key/value index
    pub fn decode_state(&self, path: &Path) -> Result<State> {
        bincode::deserialize(&self.body).map_err(|e| StateError::StateCorruption {
            path: path.to_path_buf(),
            detail: format!("snapshot body does not decode: {}", e),
        })
    }
}
