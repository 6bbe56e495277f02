//! Embedded-KV-store persistence backend, keyed by room id, for
//! deployments that prefer one `sled` database over one file per room (the
//! hub runs this way by default — see `roomsync-hub`'s config).

use async_trait::async_trait;

use super::PersistentStore;
use crate::error::{Result, RoomSyncError};
use crate::types::RoomId;

pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let db = sled::open(path).map_err(|e| RoomSyncError::PersistenceError(e.to_string()))?;
        Ok(Self { db })
    }

    #[cfg(test)]
    fn temporary() -> Self {
        let config = sled::Config::new().temporary(true);
        Self {
            db: config.open().expect("open temporary sled db"),
        }
    }
}

#[async_trait]
impl PersistentStore for SledStore {
    async fn load(&self, room_id: &RoomId) -> Result<Option<Vec<u8>>> {
        let key = room_id.as_str();
        self.db
            .get(key)
            .map(|opt| opt.map(|ivec| ivec.to_vec()))
            .map_err(|e| RoomSyncError::PersistenceError(e.to_string()))
    }

    async fn save(&self, room_id: &RoomId, snapshot: &[u8]) -> Result<()> {
        self.db
            .insert(room_id.as_str(), snapshot)
            .map_err(|e| RoomSyncError::PersistenceError(e.to_string()))?;
        self.db
            .flush_async()
            .await
            .map_err(|e| RoomSyncError::PersistenceError(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, room_id: &RoomId) -> Result<()> {
        self.db
            .remove(room_id.as_str())
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
    use std::sync::Arc;

    #[tokio::test]
    async fn round_trips_and_overwrites() {
        let store: Arc<dyn PersistentStore> = Arc::new(SledStore::temporary());
        super::super::tests::round_trips_and_overwrites(store).await;
    }
}
