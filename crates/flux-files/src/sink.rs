//! Chunk sinks: write destinations for the receiving side.

use async_trait::async_trait;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

/// Where a finished receive ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SavedArtifact {
    /// Written to a file on disk
    Path(PathBuf),
    /// Extracted into a directory (archive transfers)
    Directory(PathBuf),
    /// Accumulated in memory
    Bytes {
        /// Suggested file name
        name: String,
        /// File contents
        data: Vec<u8>,
    },
}

/// Random-offset write destination for one receive session.
///
/// Lifecycle: `prepare` once, any number of `write_at`, then exactly one of
/// `finalize` or `abandon`. Abandoning keeps whatever was written so a later
/// session for the same file can resume from a checkpoint.
#[async_trait]
pub trait ChunkSink: Send {
    /// Prepare for writing, keeping bytes below `resume_offset` when possible.
    ///
    /// Returns the offset actually usable: `resume_offset` when the previously
    /// written prefix is still present, `0` when the sink had to start over.
    async fn prepare(&mut self, resume_offset: u64) -> io::Result<u64>;

    /// Write `data` at absolute byte `offset`.
    async fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Make every completed `write_at` durable. A checkpoint may only cover
    /// bytes that have been flushed.
    async fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Flush and hand over the completed artifact.
    async fn finalize(&mut self) -> io::Result<SavedArtifact>;

    /// Stop writing without producing an artifact.
    async fn abandon(&mut self) -> io::Result<()>;
}

/// Shared byte buffer used by [`MemorySink`].
pub type SharedBuffer = Arc<Mutex<Vec<u8>>>;

fn lock_poisoned() -> io::Error {
    io::Error::other("memory sink buffer lock poisoned")
}

/// Sink that accumulates the payload in memory.
///
/// The buffer is shared so an owner (see [`crate::MemoryTarget`]) can keep a
/// partially received payload alive across sessions.
#[derive(Debug, Clone)]
pub struct MemorySink {
    name: String,
    size: u64,
    buffer: SharedBuffer,
    prepared: bool,
}

impl MemorySink {
    /// Create a sink with a fresh buffer.
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self::with_buffer(name, size, Arc::new(Mutex::new(Vec::new())))
    }

    /// Create a sink that writes into an existing shared buffer.
    pub fn with_buffer(name: impl Into<String>, size: u64, buffer: SharedBuffer) -> Self {
        Self {
            name: name.into(),
            size,
            buffer,
            prepared: false,
        }
    }

    /// Handle to the underlying buffer.
    pub fn buffer(&self) -> SharedBuffer {
        Arc::clone(&self.buffer)
    }
}

#[async_trait]
impl ChunkSink for MemorySink {
    async fn prepare(&mut self, resume_offset: u64) -> io::Result<u64> {
        let mut buf = self.buffer.lock().map_err(|_| lock_poisoned())?;
        let keep = resume_offset > 0 && resume_offset <= self.size && buf.len() as u64 == self.size;
        if !keep {
            buf.clear();
        }
        buf.resize(self.size as usize, 0);
        self.prepared = true;
        Ok(if keep { resume_offset } else { 0 })
    }

    async fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        if !self.prepared {
            return Err(io::Error::other("sink not prepared"));
        }
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|end| *end <= self.size)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "write past end of sink"))?;
        let mut buf = self.buffer.lock().map_err(|_| lock_poisoned())?;
        buf[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    async fn finalize(&mut self) -> io::Result<SavedArtifact> {
        let data = std::mem::take(&mut *self.buffer.lock().map_err(|_| lock_poisoned())?);
        Ok(SavedArtifact::Bytes {
            name: self.name.clone(),
            data,
        })
    }

    async fn abandon(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Sink that writes into `<dest>.part` and renames it into place on finalize.
///
/// The part file is pre-sized to the full length and survives `abandon`, so
/// a resumed session reopens it and continues at the checkpoint offset.
#[derive(Debug)]
pub struct FileSink {
    dest: PathBuf,
    part: PathBuf,
    size: u64,
    file: Option<File>,
}

impl FileSink {
    /// Create a sink for `dest` using `part` as the in-progress file.
    pub fn new(dest: impl Into<PathBuf>, part: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            dest: dest.into(),
            part: part.into(),
            size,
            file: None,
        }
    }

    /// Final destination path.
    pub fn dest(&self) -> &Path {
        &self.dest
    }

    /// In-progress part file path.
    pub fn part_path(&self) -> &Path {
        &self.part
    }

    async fn close_file(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ChunkSink for FileSink {
    async fn prepare(&mut self, resume_offset: u64) -> io::Result<u64> {
        if let Some(parent) = self.part.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let existing = match tokio::fs::metadata(&self.part).await {
            Ok(meta) => Some(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e),
        };
        let keep = resume_offset > 0 && existing.is_some_and(|len| len >= resume_offset);

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(!keep)
            .open(&self.part)
            .await?;
        file.set_len(self.size).await?;
        self.file = Some(file);

        let usable = if keep { resume_offset } else { 0 };
        debug!(
            "Prepared {} (resume at {} of {} bytes)",
            self.part.display(),
            usable,
            self.size
        );
        Ok(usable)
    }

    async fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        if offset + data.len() as u64 > self.size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "write past end of sink",
            ));
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::other("sink not prepared"))?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await
    }

    async fn flush(&mut self) -> io::Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush().await?;
            file.sync_data().await?;
        }
        Ok(())
    }

    async fn finalize(&mut self) -> io::Result<SavedArtifact> {
        self.close_file().await?;
        tokio::fs::rename(&self.part, &self.dest).await?;
        Ok(SavedArtifact::Path(self.dest.clone()))
    }

    async fn abandon(&mut self) -> io::Result<()> {
        self.close_file().await
    }
}
