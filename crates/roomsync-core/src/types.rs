//! Shared value types for room synchronization: room/peer/content identifiers,
//! the file manifest, and chat messages.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Minimum length, in bytes, a [`RoomId`] must have to be accepted.
pub const ROOM_ID_MIN_LEN: usize = 16;

/// Opaque room identifier. Treated as a bag of bytes; the gossip topic for a
/// room is always `wc/<RoomId>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Result<Self, crate::error::RoomSyncError> {
        let id = id.into();
        if id.len() < ROOM_ID_MIN_LEN {
            return Err(crate::error::RoomSyncError::InvalidRoomId(id));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Gossip topic name for this room: `wc/<RoomId>`.
    pub fn topic(&self) -> String {
        format!("wc/{}", self.0)
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque participant identifier: CRDT author and direct-peer map key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Self-describing content hash identifying a byte blob, optionally with a
/// small DAG of linked sub-blocks beneath it. Opaque to this crate beyond its
/// string form; equality and hashing are by that string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentId(String);

impl ContentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One entry in a room's manifest. `name`/`size` are informational; `cid` is
/// authoritative for identity and set membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub size: Option<u64>,
    pub cid: ContentId,
}

/// The shared file list for a room, plus an advisory freshness timestamp.
/// `files` is ordered for display, but membership (what counts as "the same
/// file") is keyed on `cid`, not position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub files: Vec<FileEntry>,
    pub updated_at: u64,
}

impl Manifest {
    /// Files already present, identified by cid, for set-semantics merging by
    /// callers building a manifest update (e.g. "only add files with unseen
    /// cids").
    pub fn contains_cid(&self, cid: &ContentId) -> bool {
        self.files.iter().any(|f| &f.cid == cid)
    }
}

/// A chat message, deduplicated by `msg_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub msg_id: Uuid,
    pub text: String,
    pub from: PeerId,
    pub ts: u64,
}

/// Where a [`RoomDoc`](crate::room_doc::RoomDoc) mutation came from. Drives
/// rebroadcast and persistence policy: only `Local` updates broadcast; only
/// non-`Storage` updates get persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Loaded from (or about to be written to) a [`PersistentStore`](crate::persistence::PersistentStore).
    Storage,
    /// Received over the gossip/pubsub topic.
    Network,
    /// Received over the direct hub stream opened by [`SyncEngine::join`](crate::sync_engine::SyncEngine::join).
    HubStream,
    /// Produced by a local mutation (`send_chat`, `set_manifest`, ...).
    Local,
}

/// Sync state of a [`RoomDoc`](crate::room_doc::RoomDoc). Monotone except for
/// explicit rejoin: a document may only revert to `Syncing` after an
/// explicit `join` call following `destroy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Persistence load is in flight.
    Loading,
    /// At least one `SNAPSHOT_REQUEST` is outstanding.
    Syncing,
    /// A delta or snapshot has been received from any peer.
    Synced,
}
