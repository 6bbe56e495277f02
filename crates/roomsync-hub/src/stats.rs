//! Periodic stats logging: room and peer counts every 30s, plus a per-room
//! breakdown of file/chat/stream counts.

use std::time::Duration;

use log::info;

use crate::pinning::PinTracker;
use crate::room::Rooms;

const STATS_INTERVAL: Duration = Duration::from_secs(30);

pub async fn run(rooms: Rooms, pin_tracker: std::sync::Arc<PinTracker>) {
    loop {
        tokio::time::sleep(STATS_INTERVAL).await;
        let rooms = rooms.read().await;
        let peer_count: usize = rooms.values().map(|r| r.peer_count()).sum();
        info!(
            "stats: {} room(s), {peer_count} stream(s), {} cid(s) pinned",
            rooms.len(),
            pin_tracker.pinned_count()
        );
        for room in rooms.values() {
            info!(
                "stats: room '{}': {} file(s), {} chat message(s), {} stream(s)",
                room.room_id,
                room.file_count(),
                room.chat_count(),
                room.peer_count()
            );
        }
    }
}
