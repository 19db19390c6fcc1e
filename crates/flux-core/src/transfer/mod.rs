//! Chunked file transfer engine.
//!
//! One controller task per peer data stream owns that peer's send session and
//! receive session. Control frames are JSON text; chunks are binary frames:
//!
//! ```text
//!   sender                                             receiver
//!     |--- meta {fileId, size, chunkSize, ...} ------------>|
//!     |<-- resume_req {fileId, haveUntilChunk} -------------|  (checkpoint found)
//!     |--- resume_ok {fileId, startFrom} ------------------>|
//!     |<-- ack {id, ready} ---------------------------------|
//!     |=== chunk [u32 BE index | payload] x N =============>|
//!     |--- eof {id} --------------------------------------->|
//! ```
//!
//! Either side may send `cancel {id, reason?}` at any point.

mod controller;
mod events;
mod manifest;
mod protocol;
mod service;

pub use events::{Direction, TransferContext, TransferEvent};
pub use manifest::{MAX_TOTAL_CHUNKS, Manifest, new_file_id};
pub use protocol::{CHUNK_HEADER_LEN, ControlMessage, decode_chunk, encode_chunk};
pub use service::TransferService;

use flux_files::DEFAULT_CHUNK_SIZE;

/// Transfer engine configuration
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Chunk size for outgoing transfers
    pub chunk_size: u32,
    /// Sending resumes once the stream's buffered bytes fall to this many
    /// chunks
    pub low_watermark_chunks: usize,
    /// Sending pauses while the stream buffers more than this many chunks
    pub high_watermark_chunks: usize,
    /// Persist a checkpoint every this many received chunks
    pub checkpoint_interval: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            low_watermark_chunks: 8,
            high_watermark_chunks: 32,
            checkpoint_interval: 1,
        }
    }
}

impl TransferConfig {
    /// Low watermark in bytes for a transfer using `chunk_size`.
    pub fn low_watermark(&self, chunk_size: u32) -> usize {
        chunk_size as usize * self.low_watermark_chunks
    }

    /// High watermark in bytes for a transfer using `chunk_size`.
    pub fn high_watermark(&self, chunk_size: u32) -> usize {
        chunk_size as usize * self.high_watermark_chunks
    }
}
