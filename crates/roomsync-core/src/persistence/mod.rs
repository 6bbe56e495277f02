//! Persistence backends for room state: the [`PersistentStore`] trait plus
//! two implementations, a plain filesystem backend and an embedded
//! key-value backend.

mod file_store;
mod sled_store;

pub use file_store::FileStore;
pub use sled_store::SledStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::RoomId;

/// Durable storage for a room's full-state CRDT snapshot. Implementations
/// need not be transactional across rooms; each `room_id` is an independent
/// key.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// Load the last snapshot saved for `room_id`, if any.
    async fn load(&self, room_id: &RoomId) -> Result<Option<Vec<u8>>>;

    /// Persist `snapshot` as the latest state for `room_id`, replacing
    /// whatever was there before.
    async fn save(&self, room_id: &RoomId, snapshot: &[u8]) -> Result<()>;

    /// Drop all persisted state for `room_id`. Used when a room is torn
    /// down for good, not on ordinary peer departure.
    async fn delete(&self, room_id: &RoomId) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    pub(crate) async fn round_trips_and_overwrites(store: Arc<dyn PersistentStore>) {
        let room = RoomId::new("test-room-0000001").unwrap();
        assert!(store.load(&room).await.unwrap().is_none());

        store.save(&room, b"snapshot-v1").await.unwrap();
        assert_eq!(store.load(&room).await.unwrap().unwrap(), b"snapshot-v1");

        store.save(&room, b"snapshot-v2").await.unwrap();
        assert_eq!(store.load(&room).await.unwrap().unwrap(), b"snapshot-v2");

        store.delete(&room).await.unwrap();
        assert!(store.load(&room).await.unwrap().is_none());
    }
}
