//! File-per-room persistence: each room's snapshot lives at
//! `<root>/<room_id>.snapshot`, written via a temp-file-then-rename so a
//! crash mid-write never leaves a torn snapshot on disk.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::PersistentStore;
use crate::error::{Result, RoomSyncError};
use crate::types::RoomId;

pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Opens (creating if absent) a snapshot directory at `root`.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn snapshot_path(&self, room_id: &RoomId) -> PathBuf {
        self.root.join(format!("{}.snapshot", room_id.as_str()))
    }

    fn tmp_path(&self, room_id: &RoomId) -> PathBuf {
        self.root.join(format!("{}.snapshot.tmp", room_id.as_str()))
    }
}

#[async_trait]
impl PersistentStore for FileStore {
    async fn load(&self, room_id: &RoomId) -> Result<Option<Vec<u8>>> {
        match fs::read(self.snapshot_path(room_id)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RoomSyncError::Io(e)),
        }
    }

    async fn save(&self, room_id: &RoomId, snapshot: &[u8]) -> Result<()> {
        let tmp = self.tmp_path(room_id);
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(snapshot).await?;
        file.sync_all().await?;
        fs::rename(&tmp, self.snapshot_path(room_id)).await?;
        Ok(())
    }

    async fn delete(&self, room_id: &RoomId) -> Result<()> {
        match fs::remove_file(self.snapshot_path(room_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RoomSyncError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn round_trips_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn PersistentStore> =
            Arc::new(FileStore::open(dir.path()).await.unwrap());
        super::super::tests::round_trips_and_overwrites(store).await;
    }

    #[tokio::test]
    async fn no_tmp_file_left_behind_after_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        let room = RoomId::new("leftover-tmp-check-1").unwrap();
        store.save(&room, b"data").await.unwrap();
        assert!(!store.tmp_path(&room).exists());
        assert!(store.snapshot_path(&room).exists());
    }
}
