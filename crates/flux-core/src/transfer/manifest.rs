//! Transfer manifests.

use crate::error::TransferError;
use flux_files::SourceInfo;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};

/// Largest chunk count a manifest may announce; chunk indices are `u32`.
pub const MAX_TOTAL_CHUNKS: u64 = u32::MAX as u64;

const FILE_ID_LEN: usize = 12;

/// Random identifier for sources that did not supply one.
pub fn new_file_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(FILE_ID_LEN)
        .map(char::from)
        .collect()
}

/// Description of a file announced by the sender in a `meta` frame.
///
/// Immutable once sent. The file ID doubles as the transfer ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// File identifier; keys checkpoints on the receiver
    pub file_id: String,
    /// Suggested file name
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// MIME type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    /// Bytes per chunk (the last chunk may be shorter)
    pub chunk_size: u32,
    /// `ceil(size / chunk_size)`
    pub total_chunks: u64,
    /// Payload is a packed folder
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_archive: bool,
    /// Folder the archive unpacks into
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_root: Option<String>,
}

impl Manifest {
    /// Build the manifest for an outgoing source.
    ///
    /// # Errors
    ///
    /// Returns `TransferError::InvalidSource` if the chunk size is zero or
    /// the file needs more chunks than the index space allows.
    pub fn for_source(info: &SourceInfo, chunk_size: u32) -> Result<Self, TransferError> {
        if chunk_size == 0 {
            return Err(TransferError::InvalidSource(
                "chunk size must be positive".to_string(),
            ));
        }
        let total_chunks = Self::expected_chunks(info.size, chunk_size);
        if total_chunks > MAX_TOTAL_CHUNKS {
            return Err(TransferError::InvalidSource(format!(
                "{} bytes needs {} chunks of {} bytes; at most {} are addressable",
                info.size, total_chunks, chunk_size, MAX_TOTAL_CHUNKS
            )));
        }

        Ok(Self {
            file_id: info.id.clone().unwrap_or_else(new_file_id),
            name: info.name.clone(),
            size: info.size,
            mime: info.mime.clone(),
            chunk_size,
            total_chunks,
            is_archive: info.is_archive,
            archive_root: info.archive_root.clone(),
        })
    }

    /// Chunks needed for `size` bytes.
    pub fn expected_chunks(size: u64, chunk_size: u32) -> u64 {
        if chunk_size == 0 {
            return 0;
        }
        size.div_ceil(u64::from(chunk_size))
    }

    /// Check a received manifest before accepting it.
    ///
    /// # Errors
    ///
    /// Returns `TransferError::InvalidManifest` describing the first problem.
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.file_id.is_empty() {
            return Err(TransferError::InvalidManifest("empty fileId".to_string()));
        }
        if self.chunk_size == 0 {
            return Err(TransferError::InvalidManifest(
                "chunkSize must be positive".to_string(),
            ));
        }
        if self.total_chunks > MAX_TOTAL_CHUNKS {
            return Err(TransferError::InvalidManifest(format!(
                "totalChunks {} exceeds the chunk index space",
                self.total_chunks
            )));
        }
        let expected = Self::expected_chunks(self.size, self.chunk_size);
        if self.total_chunks != expected {
            return Err(TransferError::InvalidManifest(format!(
                "totalChunks {} does not match size {} / chunkSize {} (expected {})",
                self.total_chunks, self.size, self.chunk_size, expected
            )));
        }
        Ok(())
    }

    /// Chunk count as an index bound. Only meaningful for valid manifests.
    pub fn chunk_count(&self) -> u32 {
        u32::try_from(self.total_chunks).unwrap_or(u32::MAX)
    }

    /// Byte offset of chunk `index`.
    pub fn chunk_offset(&self, index: u32) -> u64 {
        u64::from(index) * u64::from(self.chunk_size)
    }

    /// Length of chunk `index`; zero past the end.
    pub fn chunk_len(&self, index: u32) -> usize {
        let offset = self.chunk_offset(index);
        self.size
            .saturating_sub(offset)
            .min(u64::from(self.chunk_size)) as usize
    }

    /// Bytes covered by chunks `0..index`.
    pub fn bytes_before(&self, index: u32) -> u64 {
        self.chunk_offset(index).min(self.size)
    }
}
