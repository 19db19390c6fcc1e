//! Hook for unpacking received folder archives.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};

/// Unpacks a received archive into a directory.
///
/// Archive formats are outside this crate; applications plug in their own
/// unpacker. When unpacking fails the receiver keeps the archive file as the
/// saved artifact.
#[async_trait]
pub trait ArchiveUnpacker: Send + Sync {
    /// Unpack `archive`, optionally into a folder named `root`, and return
    /// the directory holding the extracted contents.
    async fn unpack(&self, archive: &Path, root: Option<&str>) -> io::Result<PathBuf>;
}
