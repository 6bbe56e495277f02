//! The hub's per-room state: a [`RoomDoc`] the hub treats as canonical,
//! plus the broadcast channel and peer bookkeeping needed to fan updates
//! out to every connected stream, wired into persistence and pinning.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex as SyncMutex;
use roomsync_core::persistence::PersistentStore;
use roomsync_core::{Origin, RoomId};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use roomsync_core::room_doc::RoomDoc;

use crate::pinning::PinTracker;

pub struct PeerInfo {
    pub log_id: usize,
}

/// A room the hub is aggregating. `tx` fans out encoded wire bytes to every
/// connected peer except the sender; `doc` is the hub's canonical,
/// always-synced copy of the room's CRDT state.
pub struct HubRoom {
    pub room_id: RoomId,
    pub tx: broadcast::Sender<(Uuid, Vec<u8>)>,
    pub doc: Arc<SyncMutex<RoomDoc>>,
    peers: RwLock<HashMap<Uuid, PeerInfo>>,
    peer_count: AtomicUsize,
}

impl HubRoom {
    /// Creates a fresh room, loading any persisted snapshot under the
    /// `storage` origin and firing the pinning observer once to cover files
    /// already present in that loaded state.
    pub async fn new(
        room_id: RoomId,
        store: Option<Arc<dyn PersistentStore>>,
        pin_tracker: Arc<PinTracker>,
    ) -> Arc<Self> {
        let (tx, _) = broadcast::channel(256);
        let doc = Arc::new(SyncMutex::new(RoomDoc::new()));

        if let Some(store) = &store {
            match store.load(&room_id).await {
                Ok(Some(snapshot)) => {
                    if let Err(e) = doc.lock().apply_update(&snapshot, Origin::Storage) {
                        log::warn!("failed to apply persisted snapshot for room {room_id}: {e}");
                    }
                }
                Ok(None) => {}
                Err(e) => log::warn!("failed to load persisted snapshot for room {room_id}: {e}"),
            }
        }

        {
            let mut locked = doc.lock();
            let doc_for_pin = pin_tracker.clone();
            locked.on_new_files(move |files| {
                doc_for_pin.on_new_files(files);
            });
            let manifest_for_pin = pin_tracker.clone();
            locked.on_manifest_update(move |manifest| {
                manifest_for_pin.on_manifest_update(manifest);
            });

            if let Some(store) = store {
                let room_id_for_save = room_id.clone();
                let doc_for_save = doc.clone();
                locked.on_update(move |_delta, origin| {
                    if origin == Origin::Storage {
                        return;
                    }
                    let store = store.clone();
                    let room_id = room_id_for_save.clone();
                    let doc = doc_for_save.clone();
                    // Deferred to a spawned task so the snapshot export (which
                    // re-locks `doc`) never runs while the mutation that
                    // triggered this observer still holds the lock.
                    tokio::spawn(async move {
                        let snapshot = doc.lock().encode_state_as_update();
                        if let Err(e) = store.save(&room_id, &snapshot).await {
                            log::warn!("failed to persist room {room_id}: {e}");
                        }
                    });
                });
            }

            pin_tracker.on_new_files(locked.manifest().files.as_slice());
        }

        Arc::new(Self {
            room_id,
            tx,
            doc,
            peers: RwLock::new(HashMap::new()),
            peer_count: AtomicUsize::new(0),
        })
    }

    pub async fn add_peer(&self, peer_id: Uuid, log_id: usize) -> usize {
        let mut peers = self.peers.write().await;
        peers.insert(peer_id, PeerInfo { log_id });
        self.peer_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> usize {
        let mut peers = self.peers.write().await;
        peers.remove(peer_id);
        self.peer_count.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn peer_count(&self) -> usize {
        self.peer_count.load(Ordering::SeqCst)
    }

    pub fn export_snapshot(&self) -> Vec<u8> {
        self.doc.lock().encode_state_as_update()
    }

    pub fn file_count(&self) -> usize {
        self.doc.lock().manifest().files.len()
    }

    pub fn chat_count(&self) -> usize {
        self.doc.lock().chat().len()
    }

    /// Apply an inbound delta/snapshot, checking it against `max_doc_size`
    /// before committing to guard against unbounded document growth.
    pub fn apply_update(&self, bytes: &[u8], origin: Origin, max_doc_size: usize) -> Result<(), String> {
        let current_size = self.doc.lock().encode_state_as_update().len();
        if current_size + bytes.len() > max_doc_size {
            return Err(format!(
                "document size limit exceeded: {current_size} + {} > {max_doc_size}",
                bytes.len()
            ));
        }
        self.doc
            .lock()
            .apply_update(bytes, origin)
            .map_err(|e| e.to_string())?;
        debug!("room {} applied update ({} bytes)", self.room_id, bytes.len());
        Ok(())
    }
}

pub type Rooms = Arc<RwLock<HashMap<String, Arc<HubRoom>>>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_client::NullContentClient;
    use loro::{ExportMode, LoroDoc};

    fn tracker() -> Arc<PinTracker> {
        PinTracker::new(Arc::new(NullContentClient), false)
    }

    async fn room() -> Arc<HubRoom> {
        HubRoom::new(RoomId::new("hub-room-test-0001").unwrap(), None, tracker()).await
    }

    #[tokio::test]
    async fn peer_count_tracks_add_and_remove() {
        let room = room().await;
        let p1 = Uuid::new_v4();
        let p2 = Uuid::new_v4();
        assert_eq!(room.add_peer(p1, 0).await, 1);
        assert_eq!(room.add_peer(p2, 1).await, 2);
        assert_eq!(room.remove_peer(&p1).await, 1);
        assert_eq!(room.peer_count(), 1);
    }

    #[tokio::test]
    async fn apply_update_rejects_oversized_document() {
        let room = room().await;
        let doc = LoroDoc::new();
        let text = doc.get_text("scratch");
        text.insert(0, &"x".repeat(1000)).unwrap();
        let update = doc.export(ExportMode::all_updates()).unwrap();

        let err = room
            .apply_update(&update, Origin::Network, 10)
            .unwrap_err();
        assert!(err.contains("size limit"));
    }

    #[tokio::test]
    async fn export_snapshot_is_empty_for_fresh_room() {
        let room = room().await;
        // An empty LoroDoc still exports a small, but non-panicking, snapshot.
        let _ = room.export_snapshot();
    }

    #[tokio::test]
    async fn persisted_snapshot_loads_on_creation_and_triggers_initial_pin() {
        use crate::content_client::ContentClient;
        use roomsync_core::persistence::{FileStore, PersistentStore};
        use roomsync_core::room_doc::RoomDoc;
        use roomsync_core::types::{FileEntry, Manifest};
        use roomsync_core::ContentId;
        use std::sync::atomic::{AtomicUsize as Counter, Ordering as CounterOrdering};

        struct CountingClient(Arc<Counter>);
        #[async_trait::async_trait]
        impl ContentClient for CountingClient {
            async fn pin(&self, _cid: &ContentId) -> anyhow::Result<()> {
                self.0.fetch_add(1, CounterOrdering::SeqCst);
                Ok(())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn PersistentStore> = Arc::new(FileStore::open(dir.path()).await.unwrap());
        let room_id = RoomId::new("hub-room-test-0002").unwrap();

        let mut seed = RoomDoc::new();
        seed.set_manifest(&Manifest {
            files: vec![FileEntry {
                name: "a.txt".into(),
                size: Some(3),
                cid: ContentId::new("C1"),
            }],
            updated_at: 1,
        })
        .unwrap();
        store.save(&room_id, &seed.encode_state_as_update()).await.unwrap();

        let pin_count = Arc::new(Counter::new(0));
        let pin_tracker = PinTracker::new(Arc::new(CountingClient(pin_count.clone())), false);
        let room = HubRoom::new(room_id, Some(store), pin_tracker).await;

        assert_eq!(room.file_count(), 1);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(pin_count.load(CounterOrdering::SeqCst), 1);
    }
}
