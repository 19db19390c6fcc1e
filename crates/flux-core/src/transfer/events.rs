//! Transfer lifecycle events.

use super::manifest::Manifest;
use flux_files::SavedArtifact;
use std::fmt;
use std::time::SystemTime;

/// Which way the bytes flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Local peer is sending
    Send,
    /// Local peer is receiving
    Receive,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Send => f.write_str("send"),
            Direction::Receive => f.write_str("receive"),
        }
    }
}

/// Identity of a transfer, carried by every event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferContext {
    /// Remote peer
    pub peer_id: String,
    /// Send or receive
    pub direction: Direction,
    /// Transfer ID (the manifest's file ID)
    pub transfer_id: String,
    /// Announced manifest
    pub manifest: Manifest,
    /// When the session was created
    pub started_at: SystemTime,
}

/// Transfer lifecycle notification.
///
/// Each session emits one `Started`, any number of `Progress`, and exactly
/// one terminal event: `Completed`, `Cancelled` or `Error`. A receive that is
/// declined before it starts emits only `Cancelled`; a manifest rejected as
/// invalid emits only `Error`.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// A session was created
    Started(TransferContext),

    /// A chunk was sent or written
    Progress {
        /// Session identity
        context: TransferContext,
        /// Bytes sent or received so far, never above `total_bytes`
        bytes_transferred: u64,
        /// File size
        total_bytes: u64,
        /// Chunk just handled
        chunk_index: u32,
    },

    /// The transfer finished
    Completed {
        /// Session identity
        context: TransferContext,
        /// Where the file ended up; `None` on the sending side
        artifact: Option<SavedArtifact>,
    },

    /// The transfer was cancelled by either side, superseded, or lost its
    /// channel
    Cancelled {
        /// Session identity
        context: TransferContext,
        /// Why
        reason: Option<String>,
    },

    /// The transfer failed
    Error {
        /// Session identity
        context: TransferContext,
        /// Human-readable description
        message: String,
    },
}

impl TransferEvent {
    /// Session identity.
    pub fn context(&self) -> &TransferContext {
        match self {
            TransferEvent::Started(context)
            | TransferEvent::Progress { context, .. }
            | TransferEvent::Completed { context, .. }
            | TransferEvent::Cancelled { context, .. }
            | TransferEvent::Error { context, .. } => context,
        }
    }

    /// Transfer ID.
    pub fn transfer_id(&self) -> &str {
        &self.context().transfer_id
    }

    /// Whether this event ends its session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferEvent::Completed { .. }
                | TransferEvent::Cancelled { .. }
                | TransferEvent::Error { .. }
        )
    }
}
