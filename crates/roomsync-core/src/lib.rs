//! Serverless-feeling room synchronization: CRDT-replicated file manifests
//! and chat over gossip pubsub plus a direct hub stream.
//!
//! `SyncEngine` is the peer-facing entry point; `roomsync-hub` (a separate
//! binary crate) uses [`room_doc`], [`codec`], and [`persistence`] directly
//! to aggregate and relay room state between peers that can't reach each
//! other over gossip alone.

pub mod codec;
pub mod error;
pub mod local_store;
pub mod outbox;
pub mod persistence;
pub mod room_doc;
pub mod sync_engine;
pub mod transport;
pub mod types;

pub use error::{Result, RoomSyncError};
pub use room_doc::RoomDoc;
pub use sync_engine::SyncEngine;
pub use types::{ChatMessage, ContentId, FileEntry, Manifest, Origin, PeerId, RoomId, SyncState};
