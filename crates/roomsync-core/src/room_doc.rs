//! The per-room CRDT document: a `manifest` map and a `chat` list backed by
//! `loro::LoroDoc`, with cached read-back copies so observers can diff
//! against prior state instead of re-reading the whole container.

use std::sync::Arc;

use loro::{ExportMode, LoroDoc, LoroList, LoroMap, LoroValue, ValueOrContainer};
use parking_lot::Mutex;

use crate::error::{Result, RoomSyncError};
use crate::types::{ChatMessage, ContentId, FileEntry, Manifest, Origin, PeerId, SyncState};

const MANIFEST_MAP: &str = "manifest";
const MANIFEST_FILES_LIST: &str = "files";
const MANIFEST_UPDATED_AT: &str = "updatedAt";
const CHAT_LIST: &str = "chat";

type ManifestObserver = Box<dyn Fn(&Manifest) + Send + Sync>;
type NewFilesObserver = Box<dyn Fn(&[FileEntry]) + Send + Sync>;
type UpdateObserver = Box<dyn Fn(&[u8], Origin) + Send + Sync>;

/// A room's replicated state plus the bookkeeping the sync design layers on
/// top of the raw CRDT: cached read-side copies of `manifest`/`chat` (so
/// observers can diff without re-walking the document), the monotone
/// [`SyncState`], and observer lists.
///
/// Ownership: a `RoomDoc` is meant to be exclusively owned by whichever
/// manager (`SyncEngine` or `Hub`) created it; observers are handed `&`
/// references inside their callback and must not retain them.
pub struct RoomDoc {
    doc: LoroDoc,
    cached_manifest: Manifest,
    cached_chat: Vec<ChatMessage>,
    sync_state: SyncState,
    update_observers: Vec<UpdateObserver>,
    manifest_observers: Vec<ManifestObserver>,
    new_files_observers: Vec<NewFilesObserver>,
}

impl RoomDoc {
    pub fn new() -> Self {
        Self {
            doc: LoroDoc::new(),
            cached_manifest: Manifest::default(),
            cached_chat: Vec::new(),
            sync_state: SyncState::Loading,
            update_observers: Vec::new(),
            manifest_observers: Vec::new(),
            new_files_observers: Vec::new(),
        }
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync_state
    }

    /// Any delta or snapshot observed from any peer marks the document
    /// `Synced`, once and monotonically (reverting only happens via
    /// `reset_to_syncing`, called on explicit rejoin).
    fn mark_synced(&mut self) {
        if !matches!(self.sync_state, SyncState::Synced) {
            self.sync_state = SyncState::Synced;
        }
    }

    pub fn reset_to_syncing(&mut self) {
        self.sync_state = SyncState::Syncing;
    }

    pub fn manifest(&self) -> &Manifest {
        &self.cached_manifest
    }

    pub fn chat(&self) -> &[ChatMessage] {
        &self.cached_chat
    }

    /// Register an observer fired after every mutation (local or applied)
    /// that changes the manifest container.
    pub fn on_manifest_update<F>(&mut self, f: F)
    where
        F: Fn(&Manifest) + Send + Sync + 'static,
    {
        self.manifest_observers.push(Box::new(f));
    }

    /// Register an observer fired with only the newly-appeared file entries
    /// (by unseen cid) after a manifest mutation.
    pub fn on_new_files<F>(&mut self, f: F)
    where
        F: Fn(&[FileEntry]) + Send + Sync + 'static,
    {
        self.new_files_observers.push(Box::new(f));
    }

    /// Register a raw update observer, receiving `(delta_bytes, origin)`.
    /// `SyncEngine`'s broadcast policy is built on this.
    pub fn on_update<F>(&mut self, f: F)
    where
        F: Fn(&[u8], Origin) + Send + Sync + 'static,
    {
        self.update_observers.push(Box::new(f));
    }

    /// Tear down every registered observer. Called on full teardown
    /// (`SyncEngine::destroy`) so a discarded engine leaves nothing behind.
    pub fn clear_observers(&mut self) {
        self.update_observers.clear();
        self.manifest_observers.clear();
        self.new_files_observers.clear();
    }

    /// Tear down only the raw update observers. `SyncEngine::join` calls
    /// this before reinstalling its own broadcast/persistence hooks so a
    /// rejoin doesn't duplicate them, without touching the
    /// `on_manifest_update`/`on_new_files` callbacks a caller may have
    /// registered independently of `join`.
    pub fn clear_update_observers(&mut self) {
        self.update_observers.clear();
    }

    /// Full-state snapshot, for `SYNC_FULL_STATE`/`SNAPSHOT` responses and
    /// for `PersistentStore::save`.
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        self.doc
            .export(ExportMode::Snapshot)
            .unwrap_or_default()
            .to_vec()
    }

    /// Apply a delta or full-state snapshot from `origin`. Idempotent:
    /// re-applying previously-observed bytes is a no-op at the CRDT layer.
    pub fn apply_update(&mut self, bytes: &[u8], origin: Origin) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.doc
            .import(bytes)
            .map_err(|e| RoomSyncError::Crdt(e.to_string()))?;

        if !matches!(origin, Origin::Storage) {
            self.mark_synced();
        }

        self.refresh_cache_and_notify(bytes, origin);
        Ok(())
    }

    /// Replace the manifest wholesale (an explicit "set" a la `SyncEngine::set_manifest`).
    pub fn set_manifest(&mut self, manifest: &Manifest) -> Result<Vec<u8>> {
        let before_vv = self.doc.oplog_vv();
        self.write_manifest(manifest)?;
        self.doc.commit();
        let delta = self
            .doc
            .export(ExportMode::updates(&before_vv))
            .map_err(|e| RoomSyncError::Crdt(e.to_string()))?
            .to_vec();
        self.refresh_cache_and_notify(&delta, Origin::Local);
        Ok(delta)
    }

    /// Append a chat message (a la `SyncEngine::send_chat`).
    pub fn append_chat(&mut self, msg: ChatMessage) -> Result<Vec<u8>> {
        let before_vv = self.doc.oplog_vv();
        let chat_list = self.doc.get_list(CHAT_LIST);
        push_chat_entry(&chat_list, &msg)?;
        self.doc.commit();
        let delta = self
            .doc
            .export(ExportMode::updates(&before_vv))
            .map_err(|e| RoomSyncError::Crdt(e.to_string()))?
            .to_vec();
        self.refresh_cache_and_notify(&delta, Origin::Local);
        Ok(delta)
    }

    fn write_manifest(&self, manifest: &Manifest) -> Result<()> {
        let map = self.doc.get_map(MANIFEST_MAP);
        map.insert(MANIFEST_UPDATED_AT, manifest.updated_at as i64)
            .map_err(|e| RoomSyncError::Crdt(e.to_string()))?;

        let files_list = map
            .insert_container(MANIFEST_FILES_LIST, LoroList::new())
            .map_err(|e| RoomSyncError::Crdt(e.to_string()))?;
        let existing_len = files_list.len();
        if existing_len > 0 {
            files_list
                .delete(0, existing_len)
                .map_err(|e| RoomSyncError::Crdt(e.to_string()))?;
        }
        for entry in &manifest.files {
            push_file_entry(&files_list, entry)?;
        }
        Ok(())
    }

    fn refresh_cache_and_notify(&mut self, delta: &[u8], origin: Origin) {
        let new_manifest = read_manifest(&self.doc);
        let new_chat = read_chat(&self.doc);

        let manifest_changed = new_manifest != self.cached_manifest;
        let new_file_entries: Vec<FileEntry> = new_manifest
            .files
            .iter()
            .filter(|f| !self.cached_manifest.contains_cid(&f.cid))
            .cloned()
            .collect();

        self.cached_manifest = new_manifest;
        self.cached_chat = new_chat;

        for obs in &self.update_observers {
            obs(delta, origin);
        }
        if manifest_changed {
            for obs in &self.manifest_observers {
                obs(&self.cached_manifest);
            }
        }
        if !new_file_entries.is_empty() {
            for obs in &self.new_files_observers {
                obs(&new_file_entries);
            }
        }
    }
}

impl Default for RoomDoc {
    fn default() -> Self {
        Self::new()
    }
}

fn push_file_entry(list: &LoroList, entry: &FileEntry) -> Result<()> {
    let map = list
        .push_container(LoroMap::new())
        .map_err(|e| RoomSyncError::Crdt(e.to_string()))?;
    map.insert("name", entry.name.clone())
        .map_err(|e| RoomSyncError::Crdt(e.to_string()))?;
    if let Some(size) = entry.size {
        map.insert("size", size as i64)
            .map_err(|e| RoomSyncError::Crdt(e.to_string()))?;
    }
    map.insert("cid", entry.cid.as_str())
        .map_err(|e| RoomSyncError::Crdt(e.to_string()))?;
    Ok(())
}

fn push_chat_entry(list: &LoroList, msg: &ChatMessage) -> Result<()> {
    let map = list
        .push_container(LoroMap::new())
        .map_err(|e| RoomSyncError::Crdt(e.to_string()))?;
    map.insert("msgId", msg.msg_id.to_string())
        .map_err(|e| RoomSyncError::Crdt(e.to_string()))?;
    map.insert("text", msg.text.clone())
        .map_err(|e| RoomSyncError::Crdt(e.to_string()))?;
    map.insert("from", msg.from.as_str())
        .map_err(|e| RoomSyncError::Crdt(e.to_string()))?;
    map.insert("ts", msg.ts as i64)
        .map_err(|e| RoomSyncError::Crdt(e.to_string()))?;
    Ok(())
}

fn value_as_str(v: &ValueOrContainer) -> Option<String> {
    match v.get_deep_value() {
        LoroValue::String(s) => Some(s.to_string()),
        _ => None,
    }
}

fn value_as_i64(v: &ValueOrContainer) -> Option<i64> {
    match v.get_deep_value() {
        LoroValue::I64(i) => Some(i),
        _ => None,
    }
}

fn read_manifest(doc: &LoroDoc) -> Manifest {
    let map = doc.get_map(MANIFEST_MAP);
    let updated_at = map
        .get(MANIFEST_UPDATED_AT)
        .and_then(|v| value_as_i64(&v))
        .unwrap_or(0) as u64;

    let mut files = Vec::new();
    if let Some(ValueOrContainer::Container(loro::Container::List(files_list))) =
        map.get(MANIFEST_FILES_LIST)
    {
        for i in 0..files_list.len() {
            let Some(ValueOrContainer::Container(loro::Container::Map(entry))) = files_list.get(i)
            else {
                continue;
            };
            let name = entry
                .get("name")
                .and_then(|v| value_as_str(&v))
                .unwrap_or_default();
            let size = entry.get("size").and_then(|v| value_as_i64(&v)).map(|s| s as u64);
            let cid = entry
                .get("cid")
                .and_then(|v| value_as_str(&v))
                .unwrap_or_default();
            files.push(FileEntry {
                name,
                size,
                cid: ContentId::new(cid),
            });
        }
    }

    Manifest { files, updated_at }
}

fn read_chat(doc: &LoroDoc) -> Vec<ChatMessage> {
    let list = doc.get_list(CHAT_LIST);
    let mut out = Vec::with_capacity(list.len());
    for i in 0..list.len() {
        let Some(ValueOrContainer::Container(loro::Container::Map(entry))) = list.get(i) else {
            continue;
        };
        let msg_id = entry
            .get("msgId")
            .and_then(|v| value_as_str(&v))
            .and_then(|s| uuid::Uuid::parse_str(&s).ok());
        let text = entry.get("text").and_then(|v| value_as_str(&v));
        let from = entry.get("from").and_then(|v| value_as_str(&v));
        let ts = entry.get("ts").and_then(|v| value_as_i64(&v)).map(|t| t as u64);
        if let (Some(msg_id), Some(text), Some(from), Some(ts)) = (msg_id, text, from, ts) {
            out.push(ChatMessage {
                msg_id,
                text,
                from: PeerId::new(from),
                ts,
            });
        }
    }
    out
}

/// Shared-ownership handle, for the common case of a doc owned by a room
/// task and read from several observer closures (`Hub`'s bridge and pinning
/// observers both need one).
pub type SharedRoomDoc = Arc<Mutex<RoomDoc>>;

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, cid: &str) -> FileEntry {
        FileEntry {
            name: name.to_string(),
            size: Some(7),
            cid: ContentId::new(cid),
        }
    }

    #[test]
    fn set_manifest_updates_cache_and_fires_observer() {
        let mut doc = RoomDoc::new();
        let seen = Arc::new(Mutex::new(0));
        let seen2 = seen.clone();
        doc.on_manifest_update(move |_m| {
            *seen2.lock() += 1;
        });

        let manifest = Manifest {
            files: vec![entry("a.txt", "C1"), entry("b.txt", "C2")],
            updated_at: 100,
        };
        doc.set_manifest(&manifest).unwrap();

        assert_eq!(*seen.lock(), 1);
        assert_eq!(doc.manifest().files.len(), 2);
        assert_eq!(doc.manifest().updated_at, 100);
    }

    #[test]
    fn new_files_observer_only_sees_unseen_cids() {
        let mut doc = RoomDoc::new();
        let new_files = Arc::new(Mutex::new(Vec::new()));
        let nf2 = new_files.clone();
        doc.on_new_files(move |files| {
            nf2.lock().extend_from_slice(files);
        });

        doc.set_manifest(&Manifest {
            files: vec![entry("a.txt", "C1")],
            updated_at: 1,
        })
        .unwrap();
        doc.set_manifest(&Manifest {
            files: vec![entry("a.txt", "C1"), entry("b.txt", "C2")],
            updated_at: 2,
        })
        .unwrap();

        let seen = new_files.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].cid, ContentId::new("C1"));
        assert_eq!(seen[1].cid, ContentId::new("C2"));
    }

    #[test]
    fn append_chat_is_visible_and_deduped_by_merge() {
        let mut doc_a = RoomDoc::new();
        let msg = ChatMessage {
            msg_id: uuid::Uuid::new_v4(),
            text: "hello".to_string(),
            from: PeerId::new("peer-a"),
            ts: 1,
        };
        doc_a.append_chat(msg.clone()).unwrap();
        assert_eq!(doc_a.chat().len(), 1);

        let mut doc_b = RoomDoc::new();
        let snapshot = doc_a.encode_state_as_update();
        doc_b.apply_update(&snapshot, Origin::Network).unwrap();
        assert_eq!(doc_b.chat().len(), 1);
        assert_eq!(doc_b.chat()[0].text, "hello");

        // Re-applying the same snapshot is idempotent.
        doc_b.apply_update(&snapshot, Origin::Network).unwrap();
        assert_eq!(doc_b.chat().len(), 1);
    }

    #[test]
    fn snapshot_merge_is_commutative_and_convergent() {
        let mut doc_a = RoomDoc::new();
        let mut doc_b = RoomDoc::new();

        doc_a
            .set_manifest(&Manifest {
                files: vec![entry("a.txt", "C1")],
                updated_at: 1,
            })
            .unwrap();
        doc_b
            .append_chat(ChatMessage {
                msg_id: uuid::Uuid::new_v4(),
                text: "hi".to_string(),
                from: PeerId::new("peer-b"),
                ts: 2,
            })
            .unwrap();

        let snap_a = doc_a.encode_state_as_update();
        let snap_b = doc_b.encode_state_as_update();

        doc_a.apply_update(&snap_b, Origin::Network).unwrap();
        doc_b.apply_update(&snap_a, Origin::Network).unwrap();

        assert_eq!(doc_a.manifest(), doc_b.manifest());
        assert_eq!(doc_a.chat().len(), doc_b.chat().len());
    }

    #[test]
    fn sync_state_starts_loading_and_marks_synced_on_network_update() {
        let mut doc = RoomDoc::new();
        assert_eq!(doc.sync_state(), SyncState::Loading);
        doc.apply_update(&[], Origin::Network).unwrap();
        // Empty bytes are a no-op; state should remain unchanged.
        assert_eq!(doc.sync_state(), SyncState::Loading);

        let mut other = RoomDoc::new();
        other
            .set_manifest(&Manifest {
                files: vec![entry("a.txt", "C1")],
                updated_at: 1,
            })
            .unwrap();
        let snap = other.encode_state_as_update();
        doc.apply_update(&snap, Origin::Network).unwrap();
        assert_eq!(doc.sync_state(), SyncState::Synced);
    }

    #[test]
    fn storage_origin_does_not_mark_synced() {
        let mut producer = RoomDoc::new();
        producer
            .set_manifest(&Manifest {
                files: vec![entry("a.txt", "C1")],
                updated_at: 1,
            })
            .unwrap();
        let snap = producer.encode_state_as_update();

        let mut doc = RoomDoc::new();
        doc.apply_update(&snap, Origin::Storage).unwrap();
        assert_eq!(doc.sync_state(), SyncState::Loading);
        assert_eq!(doc.manifest().files.len(), 1);
    }

    #[test]
    fn clear_observers_removes_all_registered_callbacks() {
        let mut doc = RoomDoc::new();
        let count = Arc::new(Mutex::new(0));
        let count2 = count.clone();
        doc.on_manifest_update(move |_| *count2.lock() += 1);
        doc.clear_observers();

        doc.set_manifest(&Manifest {
            files: vec![entry("a.txt", "C1")],
            updated_at: 1,
        })
        .unwrap();
        assert_eq!(*count.lock(), 0);
    }

    #[test]
    fn clear_update_observers_leaves_manifest_observers_intact() {
        let mut doc = RoomDoc::new();
        let update_count = Arc::new(Mutex::new(0));
        let update_count2 = update_count.clone();
        doc.on_update(move |_, _| *update_count2.lock() += 1);

        let manifest_count = Arc::new(Mutex::new(0));
        let manifest_count2 = manifest_count.clone();
        doc.on_manifest_update(move |_| *manifest_count2.lock() += 1);

        doc.clear_update_observers();

        doc.set_manifest(&Manifest {
            files: vec![entry("a.txt", "C1")],
            updated_at: 1,
        })
        .unwrap();

        assert_eq!(*update_count.lock(), 0);
        assert_eq!(*manifest_count.lock(), 1);
    }
}
