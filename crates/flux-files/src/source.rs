//! Chunk sources: random-access byte providers for the sending side.

use async_trait::async_trait;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, warn};

/// Describes what a source offers for transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceInfo {
    /// Stable identifier; keys receive-side checkpoints across retries.
    pub id: Option<String>,
    /// Display / suggested file name
    pub name: String,
    /// Total size in bytes
    pub size: u64,
    /// MIME type, if known
    pub mime: Option<String>,
    /// Payload is a packed folder archive
    pub is_archive: bool,
    /// Folder name the archive should be unpacked into
    pub archive_root: Option<String>,
}

impl SourceInfo {
    /// Create source info with just a name and size.
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            ..Self::default()
        }
    }

    /// Set the stable identifier.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the MIME type.
    #[must_use]
    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }

    /// Mark the payload as a folder archive.
    #[must_use]
    pub fn as_archive(mut self, root: impl Into<String>) -> Self {
        self.is_archive = true;
        self.archive_root = Some(root.into());
        self
    }
}

/// Random-access byte provider consumed by the send path.
///
/// A source is owned by exactly one send session. `dispose` is called once
/// when the session ends, whatever the outcome.
#[async_trait]
pub trait ChunkSource: Send {
    /// Metadata announced in the transfer manifest.
    fn info(&self) -> &SourceInfo;

    /// Read `len` bytes starting at `offset`.
    ///
    /// Reads that extend past the end are truncated; a read starting past the
    /// end is an error.
    async fn read_chunk(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>>;

    /// Release the underlying resource.
    async fn dispose(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn check_range(offset: u64, len: usize, size: u64) -> io::Result<usize> {
    if offset > size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("read offset {offset} past end of source ({size} bytes)"),
        ));
    }
    Ok(len.min((size - offset) as usize))
}

/// Source backed by an in-memory blob.
#[derive(Debug, Clone)]
pub struct MemorySource {
    info: SourceInfo,
    data: Vec<u8>,
}

impl MemorySource {
    /// Create a source from owned bytes.
    ///
    /// The id defaults to a digest of the name and contents so that
    /// re-sending the same blob resumes on the receiver.
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        let name = name.into();
        let id = crate::stable_id(&[name.as_bytes(), &data]);
        let info = SourceInfo::new(name, data.len() as u64).with_id(id);
        Self { info, data }
    }

    /// Replace the source metadata (size is always taken from the data).
    #[must_use]
    pub fn with_info(mut self, mut info: SourceInfo) -> Self {
        info.size = self.data.len() as u64;
        self.info = info;
        self
    }
}

#[async_trait]
impl ChunkSource for MemorySource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    async fn read_chunk(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let len = check_range(offset, len, self.info.size)?;
        let start = offset as usize;
        Ok(self.data[start..start + len].to_vec())
    }
}

/// Source backed by a local file, read with positioned async reads.
#[derive(Debug)]
pub struct FileSource {
    info: SourceInfo,
    path: PathBuf,
    file: Option<File>,
    temporary: bool,
}

impl FileSource {
    /// Open a file for sending.
    ///
    /// The id is derived from the canonical path, size and modification time.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or is not a regular file.
    pub async fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).await?;
        let metadata = file.metadata().await?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }

        let size = metadata.len();
        let modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let canonical = tokio::fs::canonicalize(&path)
            .await
            .unwrap_or_else(|_| path.clone());
        let id = crate::stable_id(&[
            canonical.to_string_lossy().as_bytes(),
            &size.to_le_bytes(),
            &modified.to_le_bytes(),
        ]);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());

        Ok(Self {
            info: SourceInfo::new(name, size).with_id(id),
            path,
            file: Some(file),
            temporary: false,
        })
    }

    /// Open a temporary file (typically a packed folder archive) that is
    /// deleted when the source is disposed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub async fn temporary<P: AsRef<Path>>(path: P, info: SourceInfo) -> io::Result<Self> {
        let mut source = Self::open(path).await?;
        let id = info.id.clone().or(source.info.id.take());
        source.info = SourceInfo {
            id,
            size: source.info.size,
            ..info
        };
        source.temporary = true;
        Ok(source)
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ChunkSource for FileSource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    async fn read_chunk(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let len = check_range(offset, len, self.info.size)?;
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "source disposed"))?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).await?;
        Ok(buf)
    }

    async fn dispose(&mut self) -> io::Result<()> {
        self.file = None;
        if self.temporary {
            debug!("Removing temporary source {}", self.path.display());
            if let Err(e) = tokio::fs::remove_file(&self.path).await {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to remove {}: {}", self.path.display(), e);
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}
