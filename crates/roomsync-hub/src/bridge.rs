//! WebSocket connection handling: accepts a peer, resolves it to a room,
//! and bridges gossip-style broadcast with the hub's canonical document
//! using the full [`ControlMsg`] protocol.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use roomsync_core::codec::{self, ControlMsg};
use roomsync_core::persistence::PersistentStore;
use roomsync_core::{Origin, RoomId};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::config::{Config, Modes};
use crate::pinning::PinTracker;
use crate::room::{HubRoom, Rooms};

static PEER_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn extract_room_id(path: &str) -> Option<String> {
    let path = path.strip_prefix("/ws/").unwrap_or(path);
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() {
        None
    } else {
        Some(path.to_string())
    }
}

pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    rooms: Rooms,
    config: Arc<Config>,
    modes: Modes,
    store: Option<Arc<dyn PersistentStore>>,
    pin_tracker: Arc<PinTracker>,
) -> anyhow::Result<()> {
    let log_id = PEER_COUNTER.fetch_add(1, Ordering::Relaxed);
    let peer_id = Uuid::new_v4();

    let room_path = Arc::new(std::sync::Mutex::new(None::<String>));
    let room_path_clone = room_path.clone();
    let callback = move |req: &Request, resp: Response| {
        *room_path_clone.lock().unwrap() = extract_room_id(req.uri().path());
        Ok(resp)
    };

    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
    let Some(room_path) = room_path.lock().unwrap().clone() else {
        warn!("[peer:{log_id}] connection from {addr} had no room path, closing");
        return Ok(());
    };
    let room_id = match RoomId::new(room_path) {
        Ok(id) => id,
        Err(e) => {
            warn!("[peer:{log_id}] rejected connection from {addr}: {e}");
            return Ok(());
        }
    };

    info!("[peer:{log_id}] connected from {addr} to room '{room_id}' ({peer_id})");

    {
        let rooms_read = rooms.read().await;
        if !rooms_read.contains_key(room_id.as_str()) && rooms_read.len() >= config.max_rooms {
            warn!("[peer:{log_id}] room limit reached ({}), rejecting", config.max_rooms);
            return Ok(());
        }
    }

    let room_store = if modes.sync { store.clone() } else { None };
    let room = {
        let mut rooms_write = rooms.write().await;
        if let Some(existing) = rooms_write.get(room_id.as_str()) {
            existing.clone()
        } else {
            let created = HubRoom::new(room_id.clone(), room_store, pin_tracker.clone()).await;
            rooms_write.insert(room_id.as_str().to_string(), created.clone());
            created
        }
    };

    if room.peer_count() >= config.max_peers_per_room {
        warn!(
            "[peer:{log_id}] room '{room_id}' is full ({} peers), rejecting",
            config.max_peers_per_room
        );
        return Ok(());
    }

    let peer_count = room.add_peer(peer_id, log_id).await;
    info!("[peer:{log_id}] room '{room_id}' now has {peer_count} peer(s)");

    let mut broadcast_rx = room.tx.subscribe();
    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (direct_tx, mut direct_rx) = mpsc::channel::<Vec<u8>>(32);

    let send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(bytes) = direct_rx.recv() => {
                    if ws_tx.send(Message::Binary(bytes.into())).await.is_err() {
                        break;
                    }
                }
                Ok((sender_id, bytes)) = broadcast_rx.recv() => {
                    if sender_id != peer_id && ws_tx.send(Message::Binary(bytes.into())).await.is_err() {
                        break;
                    }
                }
                else => break,
            }
        }
    });

    let room_tx = room.tx.clone();
    while let Some(msg_result) = ws_rx.next().await {
        let msg = match msg_result {
            Ok(msg) => msg,
            Err(e) => {
                warn!("[peer:{log_id}] websocket error: {e}");
                break;
            }
        };
        if msg.is_close() {
            break;
        }
        if !msg.is_binary() {
            continue;
        }
        let data = msg.into_data();
        let Ok(decoded) = codec::decode(&data) else {
            warn!("[peer:{log_id}] failed to decode control message");
            continue;
        };
        if decoded.room_id() != &room_id {
            continue;
        }

        match &decoded {
            ControlMsg::JoinRoom { .. } => {
                if !modes.sync {
                    continue;
                }
                let snapshot = room.export_snapshot();
                let response = ControlMsg::SyncFullState {
                    room_id: room_id.clone(),
                    update: snapshot,
                };
                if let Ok(bytes) = codec::encode(&response) {
                    let _ = direct_tx.send(bytes).await;
                }
            }
            ControlMsg::SyncFullState { .. } => {
                // Hub-to-peer only; a peer never sends this to the hub.
            }
            ControlMsg::YUpdate { update, .. } => {
                if modes.sync {
                    match room.apply_update(update, Origin::Network, config.max_doc_size) {
                        Ok(()) => debug!("[peer:{log_id}] applied update ({} bytes)", update.len()),
                        Err(e) => {
                            warn!("[peer:{log_id}] update rejected: {e}");
                            continue;
                        }
                    }
                    if let Ok(bytes) = codec::encode(&decoded) {
                        let _ = room_tx.send((peer_id, bytes));
                    }
                }
            }
            ControlMsg::SnapshotRequest { .. } => {
                if !modes.sync {
                    continue;
                }
                let snapshot = room.export_snapshot();
                let response = ControlMsg::Snapshot {
                    room_id: room_id.clone(),
                    update: snapshot,
                    msg_id: Uuid::new_v4(),
                    ttl: 0,
                };
                if let Ok(bytes) = codec::encode(&response) {
                    let _ = direct_tx.send(bytes).await;
                }
            }
            ControlMsg::Snapshot { update, .. } => {
                if modes.sync {
                    if let Err(e) = room.apply_update(update, Origin::Network, config.max_doc_size) {
                        warn!("[peer:{log_id}] snapshot rejected: {e}");
                    }
                }
            }
            ControlMsg::FileRequest { .. } => {
                if modes.sync {
                    if let Ok(bytes) = codec::encode(&decoded) {
                        let _ = room_tx.send((peer_id, bytes));
                    }
                }
            }
        }
    }

    send_task.abort();
    let remaining = room.remove_peer(&peer_id).await;
    info!("[peer:{log_id}] disconnected from room '{room_id}', {remaining} peer(s) remaining");

    if remaining == 0 {
        info!("[room:{room_id}] no peers remaining, removing room");
        let mut rooms_write = rooms.write().await;
        rooms_write.remove(room_id.as_str());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_room_id_strips_prefix_and_query() {
        assert_eq!(extract_room_id("/ws/my-room-0000"), Some("my-room-0000".into()));
        assert_eq!(
            extract_room_id("/ws/my-room-0000?token=abc"),
            Some("my-room-0000".into())
        );
        assert_eq!(extract_room_id("/ws/"), None);
    }
}
