//! Binary MessagePack framing for room sync control messages.
//!
//! Six message kinds, carried as a `#[serde(tag = "t", content = "d")]` enum.
//! Messages without a recognized tag fail to deserialize and are dropped by
//! the caller, never panicked on.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, RoomSyncError};
use crate::types::{ContentId, PeerId, RoomId};

fn default_ttl_one() -> u8 {
    1
}

fn default_ttl_zero() -> u8 {
    0
}

fn fresh_msg_id() -> Uuid {
    Uuid::new_v4()
}

/// Control messages exchanged over gossip topics and direct hub streams.
///
/// `update` fields carry opaque CRDT bytes (a delta or a full-state
/// snapshot); `serde_bytes` keeps them as a raw byte string in the wire
/// encoding rather than re-encoding them as a sequence of integers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t", content = "d")]
pub enum ControlMsg {
    #[serde(rename = "join_room")]
    JoinRoom { room_id: RoomId },

    #[serde(rename = "sync_full_state")]
    SyncFullState {
        room_id: RoomId,
        #[serde(with = "serde_bytes")]
        update: Vec<u8>,
    },

    #[serde(rename = "y_update")]
    YUpdate {
        room_id: RoomId,
        #[serde(with = "serde_bytes")]
        update: Vec<u8>,
        #[serde(default = "fresh_msg_id")]
        msg_id: Uuid,
        #[serde(default = "default_ttl_one")]
        ttl: u8,
    },

    #[serde(rename = "snapshot_request")]
    SnapshotRequest {
        room_id: RoomId,
        #[serde(default = "fresh_msg_id")]
        msg_id: Uuid,
        #[serde(default = "default_ttl_one")]
        ttl: u8,
    },

    #[serde(rename = "snapshot")]
    Snapshot {
        room_id: RoomId,
        #[serde(with = "serde_bytes")]
        update: Vec<u8>,
        #[serde(default = "fresh_msg_id")]
        msg_id: Uuid,
        #[serde(default = "default_ttl_one")]
        ttl: u8,
    },

    #[serde(rename = "file_request")]
    FileRequest {
        room_id: RoomId,
        cids: Vec<ContentId>,
        from: PeerId,
        #[serde(default = "fresh_msg_id")]
        msg_id: Uuid,
        #[serde(default = "default_ttl_zero")]
        ttl: u8,
    },
}

impl ControlMsg {
    /// The `msgId` carried by every variant (all variants carry one; the
    /// wire default fills it in on encode if the caller didn't set one).
    pub fn msg_id(&self) -> Uuid {
        match self {
            ControlMsg::JoinRoom { .. } => Uuid::nil(),
            ControlMsg::SyncFullState { .. } => Uuid::nil(),
            ControlMsg::YUpdate { msg_id, .. }
            | ControlMsg::SnapshotRequest { msg_id, .. }
            | ControlMsg::Snapshot { msg_id, .. }
            | ControlMsg::FileRequest { msg_id, .. } => *msg_id,
        }
    }

    pub fn ttl(&self) -> u8 {
        match self {
            ControlMsg::JoinRoom { .. } | ControlMsg::SyncFullState { .. } => 0,
            ControlMsg::YUpdate { ttl, .. }
            | ControlMsg::SnapshotRequest { ttl, .. }
            | ControlMsg::Snapshot { ttl, .. }
            | ControlMsg::FileRequest { ttl, .. } => *ttl,
        }
    }

    pub fn room_id(&self) -> &RoomId {
        match self {
            ControlMsg::JoinRoom { room_id }
            | ControlMsg::SyncFullState { room_id, .. }
            | ControlMsg::YUpdate { room_id, .. }
            | ControlMsg::SnapshotRequest { room_id, .. }
            | ControlMsg::Snapshot { room_id, .. }
            | ControlMsg::FileRequest { room_id, .. } => room_id,
        }
    }

    /// Decrement ttl for one-hop forwarding; returns `None` once exhausted.
    pub fn with_decremented_ttl(&self) -> Option<Self> {
        if self.ttl() == 0 {
            return None;
        }
        let mut clone = self.clone();
        match &mut clone {
            ControlMsg::YUpdate { ttl, .. }
            | ControlMsg::SnapshotRequest { ttl, .. }
            | ControlMsg::Snapshot { ttl, .. }
            | ControlMsg::FileRequest { ttl, .. } => *ttl -= 1,
            _ => return None,
        }
        Some(clone)
    }
}

/// Encode a control message as a MessagePack byte string.
pub fn encode(msg: &ControlMsg) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(msg)?)
}

/// Decode a control message. Unrecognized tags and malformed payloads both
/// surface as `RoomSyncError::MalformedMessage` so callers can log-and-drop
/// uniformly rather than distinguishing serde failure modes.
pub fn decode(bytes: &[u8]) -> Result<ControlMsg> {
    rmp_serde::from_slice(bytes).map_err(|e| RoomSyncError::MalformedMessage(e.to_string()))
}
