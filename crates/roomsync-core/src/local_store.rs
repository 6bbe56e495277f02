//! Peer-side room directory: the small piece of metadata a client keeps
//! about rooms it has joined before — independent of (and much smaller
//! than) the CRDT snapshot a [`crate::persistence::PersistentStore`] holds.
//! Storage is opaque to the rest of the core; callers only see the trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RoomSyncError};
use crate::types::{Manifest, RoomId};

/// A remembered room: enough to list it in a "recent rooms" UI and re-join
/// without re-deriving its manifest from scratch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomMeta {
    pub id: RoomId,
    pub name: Option<String>,
    pub manifest: Option<Manifest>,
    pub last_seen: Option<u64>,
}

#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn save_room(&self, meta: RoomMeta) -> Result<()>;
    async fn get_room(&self, id: &RoomId) -> Result<Option<RoomMeta>>;
    async fn get_rooms(&self) -> Result<Vec<RoomMeta>>;
    async fn update_room_last_seen(&self, id: &RoomId, last_seen: u64) -> Result<()>;
}

pub struct SledLocalStore {
    db: sled::Db,
}

impl SledLocalStore {
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
impl LocalStore for SledLocalStore {
    async fn save_room(&self, meta: RoomMeta) -> Result<()> {
        let bytes = serde_json::to_vec(&meta).map_err(|e| RoomSyncError::PersistenceError(e.to_string()))?;
        self.db
            .insert(meta.id.as_str(), bytes)
            .map_err(|e| RoomSyncError::PersistenceError(e.to_string()))?;
        self.db
            .flush_async()
            .await
            .map_err(|e| RoomSyncError::PersistenceError(e.to_string()))?;
        Ok(())
    }

    async fn get_room(&self, id: &RoomId) -> Result<Option<RoomMeta>> {
        let Some(bytes) = self
            .db
            .get(id.as_str())
            .map_err(|e| RoomSyncError::PersistenceError(e.to_string()))?
        else {
            return Ok(None);
        };
        let meta = serde_json::from_slice(&bytes).map_err(|e| RoomSyncError::PersistenceError(e.to_string()))?;
        Ok(Some(meta))
    }

    async fn get_rooms(&self) -> Result<Vec<RoomMeta>> {
        let mut rooms = Vec::new();
        for entry in self.db.iter() {
            let (_, bytes) = entry.map_err(|e| RoomSyncError::PersistenceError(e.to_string()))?;
            let meta = serde_json::from_slice(&bytes).map_err(|e| RoomSyncError::PersistenceError(e.to_string()))?;
            rooms.push(meta);
        }
        Ok(rooms)
    }

    async fn update_room_last_seen(&self, id: &RoomId, last_seen: u64) -> Result<()> {
        let mut meta = self.get_room(id).await?.unwrap_or(RoomMeta {
            id: id.clone(),
            name: None,
            manifest: None,
            last_seen: None,
        });
        meta.last_seen = Some(last_seen);
        self.save_room(meta).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room() -> RoomId {
        RoomId::new("local-store-test-0001").unwrap()
    }

    #[tokio::test]
    async fn save_and_get_room_round_trips() {
        let store = SledLocalStore::temporary();
        assert!(store.get_room(&room()).await.unwrap().is_none());

        store
            .save_room(RoomMeta {
                id: room(),
                name: Some("Project Room".to_string()),
                manifest: None,
                last_seen: Some(100),
            })
            .await
            .unwrap();

        let meta = store.get_room(&room()).await.unwrap().unwrap();
        assert_eq!(meta.name.as_deref(), Some("Project Room"));
        assert_eq!(meta.last_seen, Some(100));
    }

    #[tokio::test]
    async fn update_room_last_seen_creates_entry_if_absent() {
        let store = SledLocalStore::temporary();
        store.update_room_last_seen(&room(), 42).await.unwrap();
        let meta = store.get_room(&room()).await.unwrap().unwrap();
        assert_eq!(meta.last_seen, Some(42));
        assert!(meta.name.is_none());
    }

    #[tokio::test]
    async fn get_rooms_lists_everything_saved() {
        let store = SledLocalStore::temporary();
        let room_b = RoomId::new("local-store-test-0002").unwrap();
        store
            .save_room(RoomMeta {
                id: room(),
                name: None,
                manifest: None,
                last_seen: None,
            })
            .await
            .unwrap();
        store
            .save_room(RoomMeta {
                id: room_b,
                name: None,
                manifest: None,
                last_seen: None,
            })
            .await
            .unwrap();

        let rooms = store.get_rooms().await.unwrap();
        assert_eq!(rooms.len(), 2);
    }
}
