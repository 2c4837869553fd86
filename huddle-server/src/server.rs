//! WebSocket group server.
//!
//! ```text
//! Client A ──┐                         ┌── SharedGroupStore (Redis / memory)
//!            ├── connection task ──────┤
//! Client B ──┘   (Session)             ├── ChannelHub (rooms, outbound queues)
//!                     │                └── PresenceRouter
//!                     ▼
//!          GroupAdmissionController
//! ```
//!
//! Each accepted socket gets a fresh [`ChannelHandle`], an outbound queue in
//! the [`ChannelHub`] and a [`Session`]. The connection task selects between
//! inbound frames (dispatched to the controller, acked when the client asked
//! for a reply) and its outbound queue (events fanned out by other
//! connections). When the socket ends, for whatever reason, the controller's
//! disconnect cleanup runs before the channel is unregistered.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use huddle_core::{ChannelHandle, ClientFrame, Reply, ServerFrame, STATUS_OK};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;

use crate::admission::{AdmissionPolicy, GroupAdmissionController, Session};
use crate::config::{PresenceSource, ServerConfig, StoreBackend};
use crate::presence::{PresenceRouter, StorePresence, TransportPresence};
use crate::store::{MemoryStore, RedisStore, SharedGroupStore};
use crate::transport::{ChannelHub, HubStats, Outbound};
use crate::ServerError;

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_requests: u64,
    pub total_bytes: u64,
    pub malformed_frames: u64,
    pub store_errors: u64,
}

/// Everything a connection task needs, cloned once per accept.
#[derive(Clone)]
struct Shared {
    hub: Arc<ChannelHub>,
    controller: Arc<GroupAdmissionController>,
    stats: Arc<RwLock<ServerStats>>,
}

pub struct GroupServer {
    config: ServerConfig,
    store: Arc<dyn SharedGroupStore>,
    shared: Shared,
}

impl GroupServer {
    /// Build a server over an already opened store.
    pub fn new(config: ServerConfig, store: Arc<dyn SharedGroupStore>) -> Self {
        let hub = Arc::new(ChannelHub::new(config.outbound_capacity));
        let presence: Arc<dyn PresenceRouter> = match config.presence {
            PresenceSource::Transport => Arc::new(TransportPresence::new(hub.clone())),
            PresenceSource::Store => Arc::new(StorePresence::new(store.clone())),
        };
        let policy = AdmissionPolicy {
            strict_admission: config.strict_admission,
            prune_empty_groups: config.prune_empty_groups,
        };
        let controller = Arc::new(GroupAdmissionController::new(
            store.clone(),
            hub.clone(),
            presence,
            policy,
        ));

        Self {
            config,
            store,
            shared: Shared {
                hub,
                controller,
                stats: Arc::new(RwLock::new(ServerStats::default())),
            },
        }
    }

    /// Open the configured store backend and build the server on top of it.
    pub async fn connect(config: ServerConfig) -> Result<Self, ServerError> {
        let store: Arc<dyn SharedGroupStore> = match &config.store {
            StoreBackend::Memory => {
                log::warn!("Using the in-process store: group state is not shared between processes");
                Arc::new(MemoryStore::new())
            }
            StoreBackend::Redis { url } => Arc::new(RedisStore::connect(url).await?),
        };
        Ok(Self::new(config, store))
    }

    /// In-memory store with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default(), Arc::new(MemoryStore::new()))
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Group server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        shared: Shared,
    ) -> Result<(), ServerError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;

        let handle = ChannelHandle::generate();
        let outbound = shared.hub.register(&handle).await;
        let mut session = Session::new(handle.clone());
        log::info!("WebSocket connection established from {addr} as channel {handle}");

        {
            let mut s = shared.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = Self::pump(ws_stream, outbound, &mut session, &shared).await;

        // Cleanup runs whether the socket closed cleanly or failed.
        if let Err(e) = shared.controller.disconnect(&mut session).await {
            log::error!("Cleanup for channel {handle} failed: {e}");
        }
        shared.hub.unregister(&handle).await;
        {
            let mut s = shared.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        log::info!("Channel {handle} from {addr} disconnected");

        result
    }

    async fn pump(
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        mut outbound: Outbound,
        session: &mut Session,
        shared: &Shared,
    ) -> Result<(), ServerError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = shared.stats.write().await;
                                s.total_requests += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            let frame = match ClientFrame::decode(&bytes) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    log::warn!("Failed to decode frame from channel {}: {e}", session.handle());
                                    shared.stats.write().await.malformed_frames += 1;
                                    continue;
                                }
                            };

                            let event = frame.request.event_name();
                            let reply = match shared.controller.dispatch(session, frame.request).await {
                                Ok(reply) => reply,
                                Err(e) => {
                                    log::error!("{event} from channel {} failed: {e}", session.handle());
                                    shared.stats.write().await.store_errors += 1;
                                    Some(Reply::Error(e.to_string()))
                                }
                            };

                            if let Some(ack) = frame.ack {
                                let reply = reply.unwrap_or(Reply::Status(STATUS_OK));
                                let encoded = ServerFrame::Ack { ack, reply }.encode()?;
                                ws_sender.send(Message::Binary(encoded.into())).await?;
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::debug!("Channel {} closed by peer", session.handle());
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error on channel {}: {e}", session.handle());
                            break;
                        }

                        _ => {}
                    }
                }

                frame = outbound.recv() => {
                    match frame {
                        Some(bytes) => {
                            ws_sender.send(Message::Binary(bytes.to_vec().into())).await?;
                        }
                        None => break,
                    }
                }
            }
        }

        Ok(())
    }

    pub async fn stats(&self) -> ServerStats {
        self.shared.stats.read().await.clone()
    }

    pub async fn hub_stats(&self) -> HubStats {
        self.shared.hub.stats().await
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SharedGroupStore> {
        &self.store
    }

    pub fn hub(&self) -> &Arc<ChannelHub> {
        &self.shared.hub
    }

    pub fn controller(&self) -> &Arc<GroupAdmissionController> {
        &self.shared.controller
    }
}
