//! Persisted receive progress, keyed by file ID.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Progress marker for a partially received file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// Transfer / file identifier from the manifest
    pub file_id: String,
    /// First chunk index not contiguously received
    pub next_chunk_index: u32,
    /// Bytes covered by chunks `0..next_chunk_index`
    pub received_bytes: u64,
    /// Unix timestamp in milliseconds of the last update
    pub updated_at: u64,
}

impl Checkpoint {
    /// Create a checkpoint stamped with the current time.
    pub fn new(file_id: impl Into<String>, next_chunk_index: u32, received_bytes: u64) -> Self {
        let updated_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self {
            file_id: file_id.into(),
            next_chunk_index,
            received_bytes,
            updated_at,
        }
    }
}

/// Process-wide keyed store of checkpoints.
///
/// One receive session writes a given key at a time, so implementations only
/// need single-key atomicity.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Insert or replace the checkpoint for `checkpoint.file_id`.
    async fn save(&self, checkpoint: &Checkpoint) -> io::Result<()>;

    /// Look up the checkpoint for a file.
    async fn get(&self, file_id: &str) -> io::Result<Option<Checkpoint>>;

    /// Remove the checkpoint for a file. Missing keys are not an error.
    async fn clear(&self, file_id: &str) -> io::Result<()>;

    /// All stored checkpoints, most recently updated first.
    async fn list(&self) -> io::Result<Vec<Checkpoint>>;
}

/// In-memory checkpoint store.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    entries: DashMap<String, Checkpoint>,
}

impl MemoryCheckpointStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> io::Result<()> {
        self.entries
            .insert(checkpoint.file_id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn get(&self, file_id: &str) -> io::Result<Option<Checkpoint>> {
        Ok(self.entries.get(file_id).map(|e| e.value().clone()))
    }

    async fn clear(&self, file_id: &str) -> io::Result<()> {
        self.entries.remove(file_id);
        Ok(())
    }

    async fn list(&self) -> io::Result<Vec<Checkpoint>> {
        let mut all: Vec<Checkpoint> = self.entries.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(all)
    }
}

/// Checkpoint store writing one JSON document per file into a directory.
///
/// File names are a digest of the file ID, so arbitrary IDs are safe.
#[derive(Debug, Clone)]
pub struct JsonCheckpointStore {
    dir: PathBuf,
}

impl JsonCheckpointStore {
    /// Use `dir` for checkpoint files, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub async fn open<P: AsRef<Path>>(dir: P) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, file_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.json", crate::stable_id(&[file_id.as_bytes()])))
    }
}

#[async_trait]
impl CheckpointStore for JsonCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> io::Result<()> {
        let path = self.path_for(&checkpoint.file_id);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec(checkpoint)?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await
    }

    async fn get(&self, file_id: &str) -> io::Result<Option<Checkpoint>> {
        let path = self.path_for(file_id);
        let body = match tokio::fs::read(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        match serde_json::from_slice::<Checkpoint>(&body) {
            Ok(cp) if cp.file_id == file_id => Ok(Some(cp)),
            Ok(_) => Ok(None),
            Err(e) => {
                warn!("Discarding unreadable checkpoint {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    async fn clear(&self, file_id: &str) -> io::Result<()> {
        match tokio::fs::remove_file(self.path_for(file_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn list(&self) -> io::Result<Vec<Checkpoint>> {
        let mut all = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match tokio::fs::read(&path).await {
                Ok(body) => match serde_json::from_slice::<Checkpoint>(&body) {
                    Ok(cp) => all.push(cp),
                    Err(e) => debug!("Skipping {}: {}", path.display(), e),
                },
                Err(e) => debug!("Skipping {}: {}", path.display(), e),
            }
        }
        all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_wire_names() {
        let cp = Checkpoint {
            file_id: "f1".into(),
            next_chunk_index: 3,
            received_bytes: 3072,
            updated_at: 1,
        };
        let json = serde_json::to_value(&cp).unwrap();
        assert_eq!(json["fileId"], "f1");
        assert_eq!(json["nextChunkIndex"], 3);
        assert_eq!(json["receivedBytes"], 3072);
        assert_eq!(json["updatedAt"], 1);
    }

    #[tokio::test]
    async fn test_memory_store_save_get_clear() {
        let store = MemoryCheckpointStore::new();
        assert!(store.get("f1").await.unwrap().is_none());

        store.save(&Checkpoint::new("f1", 2, 2048)).await.unwrap();
        let cp = store.get("f1").await.unwrap().unwrap();
        assert_eq!(cp.next_chunk_index, 2);

        store.save(&Checkpoint::new("f1", 4, 4096)).await.unwrap();
        assert_eq!(store.get("f1").await.unwrap().unwrap().next_chunk_index, 4);

        store.clear("f1").await.unwrap();
        assert!(store.get("f1").await.unwrap().is_none());
        store.clear("f1").await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_store_list_newest_first() {
        let store = MemoryCheckpointStore::new();
        let mut old = Checkpoint::new("old", 1, 10);
        old.updated_at = 100;
        let mut new = Checkpoint::new("new", 1, 10);
        new.updated_at = 200;
        store.save(&old).await.unwrap();
        store.save(&new).await.unwrap();

        let ids: Vec<String> = store.list().await.unwrap().into_iter().map(|c| c.file_id).collect();
        assert_eq!(ids, vec!["new".to_string(), "old".to_string()]);
    }

    #[tokio::test]
    async fn test_json_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = JsonCheckpointStore::open(dir.path()).await.unwrap();
            store.save(&Checkpoint::new("a/b:c", 3, 3072)).await.unwrap();
        }
        let store = JsonCheckpointStore::open(dir.path()).await.unwrap();
        let cp = store.get("a/b:c").await.unwrap().unwrap();
        assert_eq!(cp.next_chunk_index, 3);
        assert_eq!(cp.received_bytes, 3072);
        assert_eq!(store.list().await.unwrap().len(), 1);

        store.clear("a/b:c").await.unwrap();
        assert!(store.get("a/b:c").await.unwrap().is_none());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_json_store_ignores_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonCheckpointStore::open(dir.path()).await.unwrap();
        std::fs::write(store.path_for("f1"), b"not json").unwrap();
        assert!(store.get("f1").await.unwrap().is_none());
        assert!(store.list().await.unwrap().is_empty());
    }
}
