//! # FluxShare Files
//!
//! Byte sources and destinations for the FluxShare transfer engine.
//!
//! This crate provides:
//! - Chunk sources (random-access reads over a file or in-memory blob)
//! - Chunk sinks (random-offset writes, resumable `.part` files, buffered memory)
//! - Checkpoint stores for resumable receives
//! - Save-target choosers that hand out sinks for incoming transfers
//! - A received-chunk bitmap

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod archive;
pub mod bitmap;
pub mod checkpoint;
pub mod chooser;
pub mod sink;
pub mod source;

pub use archive::ArchiveUnpacker;
pub use bitmap::ChunkBitmap;
pub use checkpoint::{Checkpoint, CheckpointStore, JsonCheckpointStore, MemoryCheckpointStore};
pub use chooser::{DeclineAll, DestinationRequest, DirectoryTarget, MemoryTarget, SaveTarget};
pub use sink::{ChunkSink, FileSink, MemorySink, SavedArtifact};
pub use source::{ChunkSource, FileSource, MemorySource, SourceInfo};

/// Default chunk size (64 KiB).
///
/// Small enough to keep a data channel responsive while other control frames
/// are interleaved, large enough that per-frame overhead stays negligible.
pub const DEFAULT_CHUNK_SIZE: u32 = 64 * 1024;

/// Derive a stable identifier from arbitrary key material.
///
/// Used for file IDs of sources that did not supply one and for checkpoint
/// file names. The result is the first 24 hex characters of a BLAKE3 digest.
#[must_use]
pub fn stable_id(parts: &[&[u8]]) -> String {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    hasher.finalize().to_hex().as_str()[..24].to_string()
}
