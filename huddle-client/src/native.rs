//! WebSocket binding of the transport contract.
//!
//! ```text
//!  request()/emit() ──► outgoing queue ──► writer task ──► WebSocket
//!                                                            │
//!  pending acks ◄── Ack{ack, reply} ◄── reader task ◄────────┘
//!  event stream ◄── Event(..) ◄─────────────┘
//! ```
//!
//! Requests that want a reply carry a per-channel ack id; the reader task
//! resolves the matching waiter. When the socket ends every waiter is
//! dropped, so nothing hangs on a dead channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use huddle_core::{ClientFrame, Reply, Request, ServerFrame};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;

use crate::adapter::{ChannelEvent, EventReceiver, TransportAdapter};
use crate::{ClientConfig, ClientError};

type PendingAcks = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

/// One live socket.
struct Connection {
    outgoing_tx: mpsc::Sender<Vec<u8>>,
    pending: PendingAcks,
    next_ack: AtomicU64,
    connected: Arc<AtomicBool>,
    /// Set before an intentional close so the reader stays quiet
    closing: Arc<AtomicBool>,
}

pub struct NativeTransport {
    config: ClientConfig,
    connection: Mutex<Option<Arc<Connection>>>,
}

impl NativeTransport {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        Ok(Self {
            config,
            connection: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Queue `request` and return the waiter for its reply. The frame is
    /// queued before this returns, so later sends cannot overtake it.
    pub async fn begin_request(
        &self,
        request: Request,
    ) -> Result<oneshot::Receiver<Reply>, ClientError> {
        let connection = self.live().await?;
        let ack = connection.next_ack.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        connection.pending.lock().await.insert(ack, tx);

        let frame = ClientFrame { ack: Some(ack), request };
        if let Err(e) = Self::send_frame(&connection, &frame).await {
            connection.pending.lock().await.remove(&ack);
            return Err(e);
        }
        Ok(rx)
    }

    async fn live(&self) -> Result<Arc<Connection>, ClientError> {
        match self.connection.lock().await.as_ref() {
            Some(connection) if connection.connected.load(Ordering::Acquire) => {
                Ok(connection.clone())
            }
            _ => Err(ClientError::NotConnected),
        }
    }

    async fn send_frame(connection: &Connection, frame: &ClientFrame) -> Result<(), ClientError> {
        let encoded = frame.encode()?;
        connection
            .outgoing_tx
            .send(encoded)
            .await
            .map_err(|_| ClientError::ChannelClosed)
    }

    async fn connect(&self) -> Result<(Connection, EventReceiver), ClientError> {
        let timeout = self.config.connection_timeout;
        let (ws_stream, _) =
            tokio::time::timeout(timeout, tokio_tungstenite::connect_async(&self.config.url))
                .await
                .map_err(|_| ClientError::ConnectionTimeout(timeout))??;
        log::info!("Connected to {}", self.config.url);

        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Vec<u8>>(256);
        let (event_tx, event_rx) = mpsc::channel(self.config.event_buffer);
        let pending: PendingAcks = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));
        let closing = Arc::new(AtomicBool::new(false));

        // Writer task: drains the outgoing queue, closes the socket when the
        // queue's last sender is gone.
        tokio::spawn(async move {
            while let Some(data) = outgoing_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task
        {
            let pending = pending.clone();
            let connected = connected.clone();
            let closing = closing.clone();
            tokio::spawn(async move {
                let reason = loop {
                    match ws_reader.next().await {
                        Some(Ok(Message::Binary(data))) => match ServerFrame::decode(&data) {
                            Ok(ServerFrame::Ack { ack, reply }) => {
                                match pending.lock().await.remove(&ack) {
                                    Some(waiter) => {
                                        // Waiter gone means the caller stopped waiting.
                                        let _ = waiter.send(reply);
                                    }
                                    None => log::debug!("Reply for unknown ack {ack} dropped"),
                                }
                            }
                            Ok(ServerFrame::Event(event)) => {
                                let _ = event_tx.send(ChannelEvent::Server(event)).await;
                            }
                            Err(e) => log::warn!("Failed to decode server frame: {e}"),
                        },
                        Some(Ok(Message::Close(frame))) => {
                            break frame
                                .map(|f| f.reason.to_string())
                                .filter(|r| !r.is_empty())
                                .unwrap_or_else(|| "server closed the channel".to_string());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break e.to_string(),
                        None => break "transport closed".to_string(),
                    }
                };

                connected.store(false, Ordering::Release);
                pending.lock().await.clear();
                if !closing.load(Ordering::Acquire) {
                    log::warn!("Channel dropped: {reason}");
                    let _ = event_tx.send(ChannelEvent::Disconnected(reason)).await;
                }
            });
        }

        let connection = Connection {
            outgoing_tx,
            pending,
            next_ack: AtomicU64::new(1),
            connected,
            closing,
        };
        Ok((connection, event_rx))
    }
}

#[async_trait]
impl TransportAdapter for NativeTransport {
    async fn open(&self) -> Result<Option<EventReceiver>, ClientError> {
        let mut slot = self.connection.lock().await;
        if let Some(connection) = slot.as_ref() {
            if connection.connected.load(Ordering::Acquire) {
                return Ok(None);
            }
        }
        let (connection, events) = self.connect().await?;
        *slot = Some(Arc::new(connection));
        Ok(Some(events))
    }

    async fn close(&self) {
        if let Some(connection) = self.connection.lock().await.take() {
            connection.closing.store(true, Ordering::Release);
            connection.connected.store(false, Ordering::Release);
            log::debug!("Closing channel to {}", self.config.url);
            // Dropping the last sender lets the writer flush and close.
        }
    }

    async fn request(&self, request: Request) -> Result<Reply, ClientError> {
        let waiter = self.begin_request(request).await?;
        waiter.await.map_err(|_| ClientError::ChannelClosed)
    }

    async fn emit(&self, request: Request) -> Result<(), ClientError> {
        let connection = self.live().await?;
        Self::send_frame(&connection, &ClientFrame { ack: None, request }).await
    }

    fn is_connected(&self) -> bool {
        match self.connection.try_lock() {
            Ok(slot) => slot
                .as_ref()
                .is_some_and(|c| c.connected.load(Ordering::Acquire)),
            // Someone is opening or closing right now.
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_new_validates_config() {
        assert!(NativeTransport::new(ClientConfig::new("")).is_err());
        assert!(NativeTransport::new(ClientConfig::default()).is_ok());
    }

    #[tokio::test]
    async fn test_requests_need_an_open_channel() {
        let transport = NativeTransport::new(ClientConfig::default()).unwrap();
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.request(Request::ListGroups).await,
            Err(ClientError::NotConnected)
        ));
        assert!(matches!(
            transport.emit(Request::Leave).await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_open_unreachable_server_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = ClientConfig::new(format!("ws://127.0.0.1:{port}"))
            .with_connection_timeout(Duration::from_secs(1));
        let transport = NativeTransport::new(config).unwrap();
        assert!(transport.open().await.is_err());
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_close_without_channel_is_noop() {
        let transport = NativeTransport::new(ClientConfig::default()).unwrap();
        transport.close().await;
        assert!(!transport.is_connected());
    }
}
