//! Save-target choosers: hand out a sink for each incoming transfer.

use crate::sink::{ChunkSink, FileSink, MemorySink, SharedBuffer};
use async_trait::async_trait;
use dashmap::DashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// What the receiver knows about an incoming file when asking for a sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationRequest {
    /// File identifier from the manifest
    pub file_id: String,
    /// Name proposed by the sender
    pub suggested_name: String,
    /// Total size in bytes
    pub size: u64,
    /// MIME type, if announced
    pub mime: Option<String>,
    /// Payload is a folder archive
    pub is_archive: bool,
}

/// Chooses where an incoming file is written.
///
/// Returning `Ok(None)` declines the transfer; the receiver then rejects the
/// manifest and reports the receive as cancelled.
#[async_trait]
pub trait SaveTarget: Send + Sync {
    /// Pick a destination for `request`.
    async fn choose_destination(
        &self,
        request: &DestinationRequest,
    ) -> io::Result<Option<Box<dyn ChunkSink>>>;
}

/// Reduce a peer-supplied name to a single safe path component.
#[must_use]
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim().trim_start_matches('.').trim();
    if trimmed.is_empty() {
        "download".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Writes incoming files into a directory.
#[derive(Debug, Clone)]
pub struct DirectoryTarget {
    dir: PathBuf,
}

impl DirectoryTarget {
    /// Save into `dir` (created on first use).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory files are written into.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Part file for a transfer. Deterministic per file ID so an interrupted
    /// receive finds its bytes again.
    fn part_path(&self, name: &str, file_id: &str) -> PathBuf {
        let tag = crate::stable_id(&[file_id.as_bytes()]);
        self.dir.join(format!(".{}.{}.part", name, &tag[..8]))
    }

    async fn free_destination(&self, name: &str) -> io::Result<PathBuf> {
        let candidate = self.dir.join(name);
        if !tokio::fs::try_exists(&candidate).await? {
            return Ok(candidate);
        }
        let (stem, ext) = match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), format!(".{ext}")),
            _ => (name.to_string(), String::new()),
        };
        for n in 1..10_000 {
            let candidate = self.dir.join(format!("{stem} ({n}){ext}"));
            if !tokio::fs::try_exists(&candidate).await? {
                return Ok(candidate);
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("no free file name for {name}"),
        ))
    }
}

#[async_trait]
impl SaveTarget for DirectoryTarget {
    async fn choose_destination(
        &self,
        request: &DestinationRequest,
    ) -> io::Result<Option<Box<dyn ChunkSink>>> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let name = sanitize_file_name(&request.suggested_name);
        let dest = self.free_destination(&name).await?;
        let part = self.part_path(&name, &request.file_id);
        Ok(Some(Box::new(FileSink::new(dest, part, request.size))))
    }
}

/// Accumulates incoming files in memory.
///
/// Buffers are kept per file ID, so an interrupted receive can resume into the
/// bytes it already has.
#[derive(Debug, Clone, Default)]
pub struct MemoryTarget {
    buffers: Arc<DashMap<String, SharedBuffer>>,
}

impl MemoryTarget {
    /// Create an empty target.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the buffer held for a file.
    pub fn forget(&self, file_id: &str) {
        self.buffers.remove(file_id);
    }

    /// Number of buffers currently held.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether no buffers are held.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

#[async_trait]
impl SaveTarget for MemoryTarget {
    async fn choose_destination(
        &self,
        request: &DestinationRequest,
    ) -> io::Result<Option<Box<dyn ChunkSink>>> {
        let buffer = self
            .buffers
            .entry(request.file_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone();
        Ok(Some(Box::new(MemorySink::with_buffer(
            request.suggested_name.clone(),
            request.size,
            buffer,
        ))))
    }
}

/// Declines every transfer.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeclineAll;

#[async_trait]
impl SaveTarget for DeclineAll {
    async fn choose_destination(
        &self,
        _request: &DestinationRequest,
    ) -> io::Result<Option<Box<dyn ChunkSink>>> {
        Ok(None)
    }
}
