//! Error kinds surfaced at the component boundaries named in the room sync
//! design: nothing in the steady-state loop is fatal, so most of these are
//! logged and dropped by callers rather than propagated.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RoomSyncError {
    #[error("room id too short (need >= 16 bytes): {0:?}")]
    InvalidRoomId(String),

    #[error("transport unavailable")]
    TransportUnavailable,

    #[error("no subscribers for topic {0}")]
    NoSubscribers(String),

    #[error("direct stream error: {0}")]
    StreamError(String),

    #[error("persistence error: {0}")]
    PersistenceError(String),

    #[error("malformed control message: {0}")]
    MalformedMessage(String),

    #[error("pin failed for {cid}: {reason}")]
    PinFailure { cid: String, reason: String },

    #[error("fatal startup error: {0}")]
    FatalStartupError(String),

    #[error("codec error: {0}")]
    Codec(#[from] rmp_serde::encode::Error),

    #[error("codec decode error: {0}")]
    CodecDecode(#[from] rmp_serde::decode::Error),

    #[error("crdt error: {0}")]
    Crdt(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RoomSyncError>;
