//! Snapshot Module
//!
//! The canonical on-disk state and the files that lead up to it.
//!
//! ## Responsibilities
//! - Deterministic encoding of the key/value index
//! - SHA-256 digests that tie each snapshot to a WAL COMMIT record
//! - Temp-file + flush + rename publication
//! - Checkpoint copies for restoring after an integrity failure

mod codec;
mod digest;
mod store;

pub use codec::{encode_state, state_digest, EncodedSnapshot, SnapshotImage, HEADER_SIZE, MAGIC};
pub use digest::{Digest, DIGEST_LEN};
pub use store::{CheckpointMeta, SnapshotStore, StoredCheckpoint, TempSnapshot};
