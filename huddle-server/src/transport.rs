//! Room-style multicast over connected channels.
//!
//! Every accepted connection registers a bounded outbound queue with the
//! [`ChannelHub`] and is automatically a member of a private room named after
//! its own handle. Private rooms live in their own namespace ([`Room`]), so a
//! group that happens to share a name with a handle never reaches that
//! channel. Group rooms are joined and left explicitly; a broadcast encodes
//! the event once and fans the bytes out to every member queue.
//!
//! ```text
//! broadcast("lobby", except = A)
//!        │ encode once
//!        ▼
//!   rooms["lobby"] = {A, B, C}
//!        │
//!        ├──► B outbound queue ──► B's WebSocket writer
//!        └──► C outbound queue ──► C's WebSocket writer
//! ```
//!
//! A member whose queue is full drops the frame (counted in [`HubStats`])
//! rather than stalling the sender.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use huddle_core::{ChannelHandle, ServerEvent, ServerFrame};
use tokio::sync::{mpsc, RwLock};

/// Encoded frames waiting to be written to one connection.
pub type Outbound = mpsc::Receiver<Arc<Vec<u8>>>;

/// Multicast primitives the admission controller relies on.
#[async_trait]
pub trait TransportChannel: Send + Sync {
    /// Add `handle` to the room `room`.
    async fn join(&self, handle: &ChannelHandle, room: &str);

    /// Remove `handle` from the room `room`.
    async fn leave(&self, handle: &ChannelHandle, room: &str);

    /// Deliver `event` to every member of `room` except `except`.
    /// Returns the number of queues that accepted the frame.
    async fn broadcast(
        &self,
        room: &str,
        except: Option<&ChannelHandle>,
        event: &ServerEvent,
    ) -> usize;

    /// Deliver `event` to a single channel. `false` if it is not connected here.
    async fn send_to(&self, handle: &ChannelHandle, event: &ServerEvent) -> bool;

    /// Membership of the group room `room`.
    async fn room_members(&self, room: &str) -> BTreeSet<ChannelHandle>;
}

/// Room key. Group names and channel handles never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Room {
    Private(ChannelHandle),
    Group(String),
}

impl Room {
    fn group(name: &str) -> Self {
        Room::Group(name.to_string())
    }
}

/// Delivery counters.
#[derive(Debug, Clone, Default)]
pub struct HubStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub active_channels: usize,
    pub active_rooms: usize,
}

#[derive(Default)]
struct HubCounters {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

/// In-process channel registry and multicast table.
pub struct ChannelHub {
    channels: RwLock<HashMap<ChannelHandle, mpsc::Sender<Arc<Vec<u8>>>>>,
    rooms: RwLock<HashMap<Room, BTreeSet<ChannelHandle>>>,
    queue_capacity: usize,
    counters: HubCounters,
}

impl ChannelHub {
    /// Create a hub whose per-channel queues buffer `queue_capacity` frames.
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
            queue_capacity: queue_capacity.max(1),
            counters: HubCounters::default(),
        }
    }

    /// Register a newly accepted channel and return its outbound queue.
    pub async fn register(&self, handle: &ChannelHandle) -> Outbound {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        self.channels.write().await.insert(handle.clone(), tx);
        self.rooms
            .write()
            .await
            .entry(Room::Private(handle.clone()))
            .or_default()
            .insert(handle.clone());
        rx
    }

    /// Drop a channel and remove it from every room, private one included.
    pub async fn unregister(&self, handle: &ChannelHandle) {
        self.channels.write().await.remove(handle);
        let mut rooms = self.rooms.write().await;
        rooms.retain(|_, members| {
            members.remove(handle);
            !members.is_empty()
        });
    }

    pub async fn is_registered(&self, handle: &ChannelHandle) -> bool {
        self.channels.read().await.contains_key(handle)
    }

    /// Full membership table, private rooms included.
    pub async fn rooms(&self) -> HashMap<Room, BTreeSet<ChannelHandle>> {
        self.rooms.read().await.clone()
    }

    pub async fn stats(&self) -> HubStats {
        HubStats {
            frames_sent: self.counters.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.counters.frames_dropped.load(Ordering::Relaxed),
            active_channels: self.channels.read().await.len(),
            active_rooms: self.rooms.read().await.len(),
        }
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    fn encode(event: &ServerEvent) -> Option<Arc<Vec<u8>>> {
        match ServerFrame::Event(event.clone()).encode() {
            Ok(bytes) => Some(Arc::new(bytes)),
            Err(e) => {
                log::error!("Failed to encode {} event: {e}", event.event_name());
                None
            }
        }
    }

    fn deliver(&self, handle: &ChannelHandle, tx: &mpsc::Sender<Arc<Vec<u8>>>, bytes: Arc<Vec<u8>>) -> bool {
        match tx.try_send(bytes) {
            Ok(()) => {
                self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Outbound queue of channel {handle} is full, frame dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

#[async_trait]
impl TransportChannel for ChannelHub {
    async fn join(&self, handle: &ChannelHandle, room: &str) {
        self.rooms
            .write()
            .await
            .entry(Room::group(room))
            .or_default()
            .insert(handle.clone());
    }

    async fn leave(&self, handle: &ChannelHandle, room: &str) {
        let mut rooms = self.rooms.write().await;
        let key = Room::group(room);
        if let Some(members) = rooms.get_mut(&key) {
            members.remove(handle);
            if members.is_empty() {
                rooms.remove(&key);
            }
        }
    }

    async fn broadcast(
        &self,
        room: &str,
        except: Option<&ChannelHandle>,
        event: &ServerEvent,
    ) -> usize {
        let Some(bytes) = Self::encode(event) else {
            return 0;
        };
        let targets: Vec<ChannelHandle> = match self.rooms.read().await.get(&Room::group(room)) {
            Some(members) => members
                .iter()
                .filter(|member| Some(*member) != except)
                .cloned()
                .collect(),
            None => return 0,
        };

        let channels = self.channels.read().await;
        targets
            .iter()
            .filter(|handle| {
                channels
                    .get(*handle)
                    .is_some_and(|tx| self.deliver(handle, tx, bytes.clone()))
            })
            .count()
    }

    async fn send_to(&self, handle: &ChannelHandle, event: &ServerEvent) -> bool {
        let Some(bytes) = Self::encode(event) else {
            return false;
        };
        let channels = self.channels.read().await;
        channels
            .get(handle)
            .is_some_and(|tx| self.deliver(handle, tx, bytes))
    }

    async fn room_members(&self, room: &str) -> BTreeSet<ChannelHandle> {
        self.rooms
            .read()
            .await
            .get(&Room::group(room))
            .cloned()
            .unwrap_or_default()
    }
}
