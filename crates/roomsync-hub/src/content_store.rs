//! Raw content-blob storage backing the hub's HTTP side-channel. Distinct
//! from `roomsync_core::local_store::LocalStore`, which holds small
//! per-room metadata on the peer side — this holds the (potentially large)
//! file bytes a manifest `cid` resolves to.

use async_trait::async_trait;
use roomsync_core::error::{Result, RoomSyncError};
use roomsync_core::ContentId;

#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn get(&self, cid: &ContentId) -> Result<Option<Vec<u8>>>;
    async fn put(&self, cid: &ContentId, bytes: &[u8]) -> Result<()>;
}

pub struct SledContentStore {
    db: sled::Db,
}

impl SledContentStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let db = sled::open(path).map_err(|e| RoomSyncError::PersistenceError(e.to_string()))?;
        Ok(Self { db })
    }
}

#[async_trait]
impl ContentStore for SledContentStore {
    async fn get(&self, cid: &ContentId) -> Result<Option<Vec<u8>>> {
        self.db
            .get(cid.as_str())
            .map(|opt| opt.map(|ivec| ivec.to_vec()))
            .map_err(|e| RoomSyncError::PersistenceError(e.to_string()))
    }

    async fn put(&self, cid: &ContentId, bytes: &[u8]) -> Result<()> {
        self.db
            .insert(cid.as_str(), bytes)
            .map_err(|e| RoomSyncError::PersistenceError(e.to_string()))?;
        self.db
            .flush_async()
            .await
            .map_err(|e| RoomSyncError::PersistenceError(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledContentStore::open(dir.path()).unwrap();
        let cid = ContentId::new("bafy-store-test");
        assert!(store.get(&cid).await.unwrap().is_none());
        store.put(&cid, b"blob bytes").await.unwrap();
        assert_eq!(store.get(&cid).await.unwrap().unwrap(), b"blob bytes");
    }
}
