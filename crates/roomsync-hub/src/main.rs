//! roomsync-hub: aggregation point bridging gossip-style room sync traffic
//! with a canonical, always-available copy of each room's document. Persists
//! snapshots, proactively pins manifest content, and serves file bytes over
//! a side-channel HTTP API.
//!
//! Usage:
//!   cargo run -p roomsync-hub -- --bind-host 0.0.0.0 --tcp-port 8080
//!
//! See `Config` for the full set of flags and their environment-variable
//! equivalents.

mod bridge;
mod config;
mod content_client;
mod content_store;
mod http;
mod pinning;
mod room;
mod stats;

use std::collections::HashMap;
use std::sync::Arc;

use log::{error, info};
use roomsync_core::persistence::{PersistentStore, SledStore};
use tokio::net::TcpListener;
use tokio::sync::RwLock;

use config::Config;
use content_client::NullContentClient;
use content_store::{ContentStore, SledContentStore};
use pinning::PinTracker;
use room::Rooms;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Arc::new(Config::from_args());
    let modes = config.modes();
    info!(
        "roomsync-hub starting: bind={}, max_peers={}, max_rooms={}, data_dir={}, modes={:?}",
        config.bind_addr(),
        config.max_peers_per_room,
        config.max_rooms,
        config.data_dir,
        modes
    );

    let snapshot_dir = format!("{}/ydocs", config.data_dir);
    let content_dir = format!("{}/content", config.data_dir);
    let store: Arc<dyn PersistentStore> = Arc::new(SledStore::open(&snapshot_dir)?);
    let content_store: Arc<dyn ContentStore> = Arc::new(SledContentStore::open(&content_dir)?);
    let content_client = Arc::new(NullContentClient);
    let pin_tracker = PinTracker::new(content_client.clone(), modes.mirror);

    let rooms: Rooms = Arc::new(RwLock::new(HashMap::new()));

    let stats_task = tokio::spawn(stats::run(rooms.clone(), pin_tracker.clone()));

    let http_config = config.clone();
    let http_task = tokio::spawn(async move {
        let app = http::router(content_store, content_client);
        let upload_addr = http_config.upload_addr();
        match TcpListener::bind(&upload_addr).await {
            Ok(listener) => {
                info!("content endpoint listening on http://{upload_addr}");
                if let Err(e) = axum::serve(listener, app).await {
                    error!("content endpoint stopped: {e}");
                }
            }
            Err(e) => error!("failed to bind content endpoint: {e}"),
        }
    });

    let bind_addr = config.bind_addr();
    let listener = TcpListener::bind(&bind_addr).await?;
    info!("roomsync-hub listening on ws://{bind_addr}");

    while let Ok((stream, addr)) = listener.accept().await {
        let rooms = rooms.clone();
        let config = config.clone();
        let store = store.clone();
        let pin_tracker = pin_tracker.clone();
        tokio::spawn(async move {
            if let Err(e) =
                bridge::handle_connection(stream, addr, rooms, config, modes, Some(store), pin_tracker)
                    .await
            {
                error!("connection error from {addr}: {e}");
            }
        });
    }

    stats_task.abort();
    http_task.abort();
    Ok(())
}
