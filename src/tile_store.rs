//! Tile persistence keyed by (object id, tile index)
//!
//! Stores are best-effort: callers treat read failures as misses and write
//! failures as non-fatal. A stored tile always holds exactly the bytes
//! upstream returned for that tile's range.

use crate::disk_format::{atomic_write, decode_frame, encode_frame, hashed_name};
use crate::error::{ProxyError, Result};
use crate::models::ObjectId;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{debug, warn};

const TILE_MAGIC: &[u8; 4] = b"TPT2";

/// Tile file payload; the key travels with the bytes so hash collisions read as misses
#[derive(Serialize, Deserialize)]
struct StoredTile {
    object: String,
    index: u64,
    data: Bytes,
}

/// Persistent mapping from (object, tile index) to tile bytes
#[async_trait]
pub trait TileStore: Send + Sync {
    /// Stored tile, or `None` on a miss
    async fn get(&self, object: &ObjectId, index: u64) -> Result<Option<Bytes>>;

    /// Store a tile, replacing any previous copy
    async fn put(&self, object: &ObjectId, index: u64, data: Bytes) -> Result<()>;

    /// Drop every tile of one object
    async fn remove_object(&self, object: &ObjectId) -> Result<()>;

    /// Drop every tile
    async fn clear(&self) -> Result<()>;
}

/// In-memory tile store
#[derive(Default)]
pub struct MemoryTileStore {
    tiles: RwLock<HashMap<(ObjectId, u64), Bytes>>,
}

impl MemoryTileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.tiles.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tiles.read().await.is_empty()
    }
}

#[async_trait]
impl TileStore for MemoryTileStore {
    async fn get(&self, object: &ObjectId, index: u64) -> Result<Option<Bytes>> {
        Ok(self.tiles.read().await.get(&(object.clone(), index)).cloned())
    }

    async fn put(&self, object: &ObjectId, index: u64, data: Bytes) -> Result<()> {
        self.tiles.write().await.insert((object.clone(), index), data);
        Ok(())
    }

    async fn remove_object(&self, object: &ObjectId) -> Result<()> {
        self.tiles.write().await.retain(|(id, _), _| id != object);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.tiles.write().await.clear();
        Ok(())
    }
}

/// File-backed tile store
///
/// Layout: `<base>/<hash prefix>/<object hash>/<index>.tile`, each file one
/// checksummed frame. A frame that fails verification is removed and
/// reported as a miss.
pub struct DiskTileStore {
    base: PathBuf,
}

impl DiskTileStore {
    pub async fn new(base: impl Into<PathBuf>) -> Result<Self> {
        let base = base.into();
        tokio::fs::create_dir_all(&base).await.map_err(|e| {
            ProxyError::TileStoreError(format!(
                "Failed to create tile directory {}: {}",
                base.display(),
                e
            ))
        })?;
        Ok(DiskTileStore { base })
    }

    fn object_dir(&self, object: &ObjectId) -> PathBuf {
        let hash = hashed_name(object.as_str());
        self.base.join(&hash[..2]).join(hash)
    }

    fn tile_path(&self, object: &ObjectId, index: u64) -> PathBuf {
        self.object_dir(object).join(format!("{}.tile", index))
    }
}

#[async_trait]
impl TileStore for DiskTileStore {
    async fn get(&self, object: &ObjectId, index: u64) -> Result<Option<Bytes>> {
        let path = self.tile_path(object, index);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ProxyError::TileStoreError(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let stored = decode_frame(TILE_MAGIC, &data)
            .and_then(|payload| bincode::deserialize::<StoredTile>(payload).ok());
        match stored {
            Some(stored) if stored.object == object.as_str() && stored.index == index => {
                Ok(Some(stored.data))
            }
            Some(stored) => {
                debug!(
                    "Tile file {} belongs to {}#{}, not {}#{}",
                    path.display(),
                    stored.object,
                    stored.index,
                    object,
                    index
                );
                Ok(None)
            }
            None => {
                warn!(
                    "Corrupt tile {} of object {} at {}, discarding",
                    index,
                    object,
                    path.display()
                );
                let _ = tokio::fs::remove_file(&path).await;
                Ok(None)
            }
        }
    }

    async fn put(&self, object: &ObjectId, index: u64, data: Bytes) -> Result<()> {
        let path = self.tile_path(object, index);
        let len = data.len();
        let stored = StoredTile {
            object: object.as_str().to_string(),
            index,
            data,
        };
        let payload = bincode::serialize(&stored)
            .map_err(|e| ProxyError::TileStoreError(format!("Failed to encode tile: {}", e)))?;
        let frame = encode_frame(TILE_MAGIC, &payload);
        atomic_write(&path, &frame).await.map_err(|e| {
            ProxyError::TileStoreError(format!("Failed to write {}: {}", path.display(), e))
        })?;
        debug!("Stored tile {} of object {} ({} bytes)", index, object, len);
        Ok(())
    }

    async fn remove_object(&self, object: &ObjectId) -> Result<()> {
        let dir = self.object_dir(object);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ProxyError::TileStoreError(format!(
                "Failed to remove {}: {}",
                dir.display(),
                e
            ))),
        }
    }

    async fn clear(&self) -> Result<()> {
        let mut entries = tokio::fs::read_dir(&self.base).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(&path).await?;
            } else {
                tokio::fs::remove_file(&path).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(id: &str) -> ObjectId {
        ObjectId::new(id).unwrap()
    }

    #[tokio::test]
    async fn test_memory_store_put_get() {
        let store = MemoryTileStore::new();
        let id = object("doc1");

        assert_eq!(store.get(&id, 0).await.unwrap(), None);
        store.put(&id, 0, Bytes::from_static(b"tile0")).await.unwrap();
        assert_eq!(
            store.get(&id, 0).await.unwrap(),
            Some(Bytes::from_static(b"tile0"))
        );
        assert_eq!(store.get(&id, 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_store_remove_object() {
        let store = MemoryTileStore::new();
        store.put(&object("a"), 0, Bytes::from_static(b"x")).await.unwrap();
        store.put(&object("a"), 1, Bytes::from_static(b"y")).await.unwrap();
        store.put(&object("b"), 0, Bytes::from_static(b"z")).await.unwrap();

        store.remove_object(&object("a")).await.unwrap();
        assert_eq!(store.len().await, 1);

        store.clear().await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_disk_store_put_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskTileStore::new(dir.path()).await.unwrap();
        let id = object("1AbCdEf");
        let data = Bytes::from(vec![7u8; 4096]);

        store.put(&id, 2, data.clone()).await.unwrap();
        assert_eq!(store.get(&id, 2).await.unwrap(), Some(data));
        assert_eq!(store.get(&id, 3).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_disk_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = object("persisted");
        {
            let store = DiskTileStore::new(dir.path()).await.unwrap();
            store.put(&id, 0, Bytes::from_static(b"kept")).await.unwrap();
        }
        let store = DiskTileStore::new(dir.path()).await.unwrap();
        assert_eq!(
            store.get(&id, 0).await.unwrap(),
            Some(Bytes::from_static(b"kept"))
        );
    }

    #[tokio::test]
    async fn test_disk_store_corrupt_tile_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskTileStore::new(dir.path()).await.unwrap();
        let id = object("doc");
        store.put(&id, 0, Bytes::from_static(b"good bytes")).await.unwrap();

        let path = store.tile_path(&id, 0);
        let mut raw = tokio::fs::read(&path).await.unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x55;
        tokio::fs::write(&path, raw).await.unwrap();

        assert_eq!(store.get(&id, 0).await.unwrap(), None);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_disk_store_rejects_tile_of_another_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskTileStore::new(dir.path()).await.unwrap();
        let owner = object("owner");
        let other = object("other");
        store.put(&owner, 0, Bytes::from_static(b"owner bytes")).await.unwrap();

        // Same file name under another key, as a hash collision would produce
        let foreign = store.tile_path(&other, 0);
        tokio::fs::create_dir_all(foreign.parent().unwrap()).await.unwrap();
        tokio::fs::copy(store.tile_path(&owner, 0), &foreign).await.unwrap();

        assert_eq!(store.get(&other, 0).await.unwrap(), None);
        assert_eq!(
            store.get(&owner, 0).await.unwrap(),
            Some(Bytes::from_static(b"owner bytes"))
        );
    }

    #[tokio::test]
    async fn test_disk_store_remove_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskTileStore::new(dir.path()).await.unwrap();
        store.put(&object("a"), 0, Bytes::from_static(b"1")).await.unwrap();
        store.put(&object("b"), 0, Bytes::from_static(b"2")).await.unwrap();

        store.remove_object(&object("a")).await.unwrap();
        assert_eq!(store.get(&object("a"), 0).await.unwrap(), None);
        assert!(store.get(&object("b"), 0).await.unwrap().is_some());

        store.remove_object(&object("missing")).await.unwrap();

        store.clear().await.unwrap();
        assert_eq!(store.get(&object("b"), 0).await.unwrap(), None);
    }
}
