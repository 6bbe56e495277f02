//! Transport abstraction: gossip-style topic pubsub plus a direct,
//! point-to-point hub stream per room, both carrying already-encoded
//! [`crate::codec::ControlMsg`] bytes.
//!
//! Two implementations: [`MemoryTransport`], an in-process fake backed by
//! broadcast channels (for tests and the single-process demo), and
//! [`WsTransport`], which multiplexes both kinds of traffic over one
//! `tokio-tungstenite` WebSocket connection to a `roomsync-hub`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::codec::{self, ControlMsg};
use crate::error::{Result, RoomSyncError};
use crate::types::RoomId;

pub type TopicReceiver = mpsc::UnboundedReceiver<Vec<u8>>;

/// A direct stream to the hub for one room: request/response traffic that
/// shouldn't fan out to every gossip subscriber (e.g. `SYNC_FULL_STATE` on
/// join).
pub struct HubStreamHandle {
    room_id: RoomId,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl HubStreamHandle {
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn send(&self, bytes: Vec<u8>) -> Result<()> {
        self.outbound
            .send(bytes)
            .map_err(|_| RoomSyncError::StreamError("hub stream closed".into()))
    }

    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.inbound.recv().await
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish already-encoded bytes to every current subscriber of
    /// `topic`. Returns `NoSubscribers` if nobody is listening yet, so
    /// callers can route the send through an [`crate::outbox::Outbox`].
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    /// Subscribe to `topic`, receiving every future `publish` to it.
    async fn subscribe(&self, topic: &str) -> Result<TopicReceiver>;

    /// Open a direct stream to the hub for `room_id`.
    async fn open_hub_stream(&self, room_id: &RoomId) -> Result<HubStreamHandle>;

    /// Number of current subscribers of `topic`, as far as this transport
    /// can see. Used to gate retry broadcasts (no point shouting into an
    /// empty topic) rather than to make correctness decisions.
    async fn subscriber_count(&self, topic: &str) -> usize;

    /// Number of known peers in the wider mesh, as far as this transport
    /// can see. Distinct from `subscriber_count`: a topic can have zero
    /// local subscribers while peers still exist elsewhere in the mesh.
    async fn peer_count(&self) -> usize;
}

/// In-process fake transport. Several `MemoryTransport` handles cloned from
/// the same [`MemoryTransport::new`] call (or built via [`MemoryTransport::hub`])
/// share state and can talk to each other, simulating a hub-mediated mesh
/// without a real socket.
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<MemoryTransportInner>,
}

struct MemoryTransportInner {
    topics: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
    hub_streams: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryTransportInner {
                topics: Mutex::new(HashMap::new()),
                hub_streams: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn topic_sender(&self, topic: &str) -> broadcast::Sender<Vec<u8>> {
        let mut topics = self.inner.topics.lock();
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }

    fn hub_sender(&self, room_id: &RoomId) -> broadcast::Sender<Vec<u8>> {
        let mut streams = self.inner.hub_streams.lock();
        streams
            .entry(room_id.as_str().to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let sender = self.topic_sender(topic);
        if sender.receiver_count() == 0 {
            return Err(RoomSyncError::NoSubscribers(topic.to_string()));
        }
        let _ = sender.send(payload);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<TopicReceiver> {
        let sender = self.topic_sender(topic);
        let mut broadcast_rx = sender.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                match broadcast_rx.recv().await {
                    Ok(bytes) => {
                        if tx.send(bytes).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("memory transport subscriber lagged by {n} messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(rx)
    }

    async fn open_hub_stream(&self, room_id: &RoomId) -> Result<HubStreamHandle> {
        let sender = self.hub_sender(room_id);
        let mut broadcast_rx = sender.subscribe();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok(bytes) = broadcast_rx.recv().await {
                if inbound_tx.send(bytes).is_err() {
                    break;
                }
            }
        });

        let outbound_sender = sender;
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::spawn(async move {
            while let Some(bytes) = outbound_rx.recv().await {
                let _ = outbound_sender.send(bytes);
            }
        });

        Ok(HubStreamHandle {
            room_id: room_id.clone(),
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }

    async fn subscriber_count(&self, topic: &str) -> usize {
        self.topic_sender(topic).receiver_count()
    }

    async fn peer_count(&self) -> usize {
        self.inner
            .hub_streams
            .lock()
            .values()
            .map(|sender| sender.receiver_count())
            .sum()
    }
}

/// Real transport: one WebSocket connection to a `roomsync-hub`, demuxed by
/// room id into per-topic gossip channels and per-room direct-stream
/// channels.
pub struct WsTransport {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    gossip_subs: Arc<Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>>>,
    hub_subs: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Vec<u8>>>>>,
}

impl WsTransport {
    pub async fn connect(url: &str) -> Result<Self> {
        let parsed = url::Url::parse(url).map_err(|e| RoomSyncError::StreamError(e.to_string()))?;
        let (ws_stream, _) = tokio_tungstenite::connect_async(parsed.as_str())
            .await
            .map_err(|e| RoomSyncError::StreamError(e.to_string()))?;
        let (mut sink, mut stream) = ws_stream.split();

        let gossip_subs: Arc<Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let hub_subs: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Vec<u8>>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::spawn(async move {
            while let Some(bytes) = outbound_rx.recv().await {
                if sink.send(WsMessage::Binary(bytes.into())).await.is_err() {
                    break;
                }
            }
        });

        let reader_gossip = gossip_subs.clone();
        let reader_hub = hub_subs.clone();
        tokio::spawn(async move {
            while let Some(Ok(msg)) = stream.next().await {
                let WsMessage::Binary(bytes) = msg else {
                    continue;
                };
                let bytes = bytes.to_vec();
                let Ok(decoded) = codec::decode(&bytes) else {
                    debug!("dropping malformed frame from hub");
                    continue;
                };
                let topic = decoded.room_id().topic();

                if let Some(tx) = reader_hub.lock().get(decoded.room_id().as_str()) {
                    let _ = tx.send(bytes.clone());
                }
                if let Some(subs) = reader_gossip.lock().get(&topic) {
                    for sub in subs {
                        let _ = sub.send(bytes.clone());
                    }
                }
            }
        });

        Ok(Self {
            outbound: outbound_tx,
            gossip_subs,
            hub_subs,
        })
    }

    fn send_raw(&self, bytes: Vec<u8>) -> Result<()> {
        self.outbound
            .send(bytes)
            .map_err(|_| RoomSyncError::TransportUnavailable)
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let has_local_subs = self
            .gossip_subs
            .lock()
            .get(topic)
            .map(|v| !v.is_empty())
            .unwrap_or(false);
        if !has_local_subs {
            // The hub fans out server-side; a local subscriber check here
            // would be wrong for remote peers, so publish always succeeds
            // once the socket itself is live.
            debug!("publishing to {topic} with no local subscribers registered yet");
        }
        self.send_raw(payload)
    }

    async fn subscribe(&self, topic: &str) -> Result<TopicReceiver> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.gossip_subs
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        // A real join also has to tell the hub which topic this connection
        // cares about; callers are expected to publish a JoinRoom control
        // message themselves right after subscribing.
        Ok(rx)
    }

    async fn open_hub_stream(&self, room_id: &RoomId) -> Result<HubStreamHandle> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.hub_subs.lock().insert(room_id.as_str().to_string(), tx);
        Ok(HubStreamHandle {
            room_id: room_id.clone(),
            outbound: self.outbound.clone(),
            inbound: rx,
        })
    }

    async fn subscriber_count(&self, topic: &str) -> usize {
        // Real subscriber counts live at the hub; this only reflects local
        // registrations on this connection, same caveat as `publish`.
        self.gossip_subs.lock().get(topic).map(Vec::len).unwrap_or(0)
    }

    async fn peer_count(&self) -> usize {
        // The client has no visibility into the wider mesh's peer count;
        // treat it as unknown rather than guess, so the mesh-timeout gate
        // in `spawn_snapshot_ticker` never stalls waiting on a signal we
        // can't actually provide.
        0
    }
}
