//! Transfer wire format.
//!
//! Control frames are JSON objects tagged by `type`. Chunk frames are binary:
//!
//! ```text
//! +----------------------+---------------------------+
//! | chunk index (u32 BE) | payload (chunkSize bytes, |
//! |       4 bytes        |  last chunk may be short) |
//! +----------------------+---------------------------+
//! ```

use super::manifest::Manifest;
use crate::error::TransferError;
use serde::{Deserialize, Serialize};

/// Length of the chunk index prefix.
pub const CHUNK_HEADER_LEN: usize = 4;

/// JSON control frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Sender announces a file
    Meta(Manifest),

    /// Receiver accepts or declines a manifest
    Ack {
        /// File ID from the manifest
        id: String,
        /// `true` to start streaming
        ready: bool,
    },

    /// Sender has sent every chunk
    Eof {
        /// File ID
        id: String,
    },

    /// Either side abandons a transfer
    Cancel {
        /// File ID
        id: String,
        /// Human-readable reason
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Receiver already holds chunks `0..have_until_chunk`
    #[serde(rename_all = "camelCase")]
    ResumeReq {
        /// File ID
        file_id: String,
        /// First chunk index the receiver still needs
        have_until_chunk: u32,
    },

    /// Sender confirms where streaming will start
    #[serde(rename_all = "camelCase")]
    ResumeOk {
        /// File ID
        file_id: String,
        /// First chunk index that will be sent
        start_from: u32,
    },
}

impl ControlMessage {
    /// Decode a text frame.
    ///
    /// # Errors
    ///
    /// Returns `TransferError::InvalidFrame` for malformed JSON or unknown
    /// frame types.
    pub fn parse(text: &str) -> Result<Self, TransferError> {
        serde_json::from_str(text).map_err(|e| TransferError::InvalidFrame(e.to_string()))
    }

    /// Encode as a text frame.
    ///
    /// # Errors
    ///
    /// Returns `TransferError::InvalidFrame` if serialization fails.
    pub fn to_text(&self) -> Result<String, TransferError> {
        serde_json::to_string(self).map_err(|e| TransferError::InvalidFrame(e.to_string()))
    }

    /// Frame type name
    pub fn message_type(&self) -> &'static str {
        match self {
            ControlMessage::Meta(_) => "meta",
            ControlMessage::Ack { .. } => "ack",
            ControlMessage::Eof { .. } => "eof",
            ControlMessage::Cancel { .. } => "cancel",
            ControlMessage::ResumeReq { .. } => "resume_req",
            ControlMessage::ResumeOk { .. } => "resume_ok",
        }
    }
}

/// Build a binary chunk frame.
pub fn encode_chunk(index: u32, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(CHUNK_HEADER_LEN + payload.len());
    frame.extend_from_slice(&index.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Split a binary chunk frame into index and payload.
///
/// Returns `None` for frames shorter than the index prefix.
pub fn decode_chunk(frame: &[u8]) -> Option<(u32, &[u8])> {
    let (header, payload) = frame.split_first_chunk::<CHUNK_HEADER_LEN>()?;
    Some((u32::from_be_bytes(*header), payload))
}
