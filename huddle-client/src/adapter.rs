//! The transport contract a [`ClientSession`](crate::ClientSession) drives.
//!
//! A channel is opened lazily by the first operation that needs it and
//! reused while it stays connected. Opening a fresh channel hands back a new
//! event stream; reusing the live one hands back nothing, the previous
//! stream keeps flowing.

use async_trait::async_trait;
use huddle_core::{Reply, Request, ServerEvent};
use tokio::sync::mpsc;

use crate::ClientError;

/// Something that happened on the channel without being asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Server(ServerEvent),
    /// The channel dropped without [`TransportAdapter::close`] being called.
    Disconnected(String),
}

pub type EventReceiver = mpsc::Receiver<ChannelEvent>;

#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Connect if needed. `Some` carries the event stream of a fresh channel.
    async fn open(&self) -> Result<Option<EventReceiver>, ClientError>;

    /// Tear the channel down. No `Disconnected` event follows.
    async fn close(&self);

    /// Send a request and wait for its reply.
    async fn request(&self, request: Request) -> Result<Reply, ClientError>;

    /// Send a request nobody waits on.
    async fn emit(&self, request: Request) -> Result<(), ClientError>;

    fn is_connected(&self) -> bool;

    /// Free everything behind the adapter. It is unusable afterwards.
    async fn release(&self) {
        self.close().await;
    }
}
