//! Client session state machine.
//!
//! ```text
//!               join()                approved
//! Disconnected ───────► Joining ─────────────────► Joined
//!      ▲                  │ rejected / failure       │
//!      │◄─────────────────┘                          │ leave() / group deleted
//!      │                                             ▼
//!      └──────────────────────────────────────── Leaving
//!
//! dispose() from any state ──► Disposed (terminal)
//! ```
//!
//! Every transition happens under one lock. Waits on the transport race a
//! cancellation token: `leave()` cancels a pending join, `dispose()` cancels
//! everything. Cancelling a wait never cancels the call already on the wire;
//! its late reply is simply dropped.

use std::future::Future;
use std::sync::Arc;

use huddle_core::{
    CreateGroupResponse, JoinDecision, ListGroupsResponse, Message, Reply, Request, ServerEvent,
};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::adapter::{ChannelEvent, EventReceiver, TransportAdapter};
use crate::{ClientError, JoiningConfig};

/// Reason reported with [`SessionEvent::Leaving`] after a voluntary leave.
pub const LEAVE_REQUEST: &str = "leave request";
/// Reason reported with [`SessionEvent::Leaving`] when the group is deleted.
pub const GROUP_DELETED: &str = "delete group";

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Joining,
    Joined,
    Leaving,
    Disposed,
}

/// Events surfaced to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Join approved; carries our client id
    Joined(String),
    JoinRejected,
    /// We are leaving the group on purpose
    Leaving(String),
    /// The channel dropped while in a group
    UnexpectedLeft(String),
    ClientJoined(String),
    ClientLeaving(String),
    MessageReceived { from: String, content: String },
}

struct SessionInner {
    state: SessionState,
    group: Option<String>,
    /// Cancels the join currently in flight, if any
    join_cancel: Option<CancellationToken>,
    /// Bumped by every join so a stale one can tell it was superseded
    join_generation: u64,
    forwarder: Option<JoinHandle<()>>,
}

/// Shared between the session and its event forwarding task.
struct Shared {
    adapter: Arc<dyn TransportAdapter>,
    inner: Mutex<SessionInner>,
    event_tx: mpsc::Sender<SessionEvent>,
}

impl Shared {
    /// Never waits on the application: a full buffer drops the event.
    fn emit_event(&self, event: SessionEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                log::warn!("Session event buffer is full, dropped {event:?}");
            }
        }
    }
}

pub struct ClientSession {
    client_id: String,
    shared: Arc<Shared>,
    /// Root token; cancelled on dispose
    disposed: CancellationToken,
    event_rx: Option<mpsc::Receiver<SessionEvent>>,
}

impl ClientSession {
    /// New session with a generated client id.
    pub fn new(adapter: Arc<dyn TransportAdapter>) -> Self {
        Self::with_client_id(adapter, Uuid::new_v4().to_string())
    }

    pub fn with_client_id(adapter: Arc<dyn TransportAdapter>, client_id: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        Self {
            client_id: client_id.into(),
            shared: Arc::new(Shared {
                adapter,
                inner: Mutex::new(SessionInner {
                    state: SessionState::Disconnected,
                    group: None,
                    join_cancel: None,
                    join_generation: 0,
                    forwarder: None,
                }),
                event_tx,
            }),
            disposed: CancellationToken::new(),
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.take()
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub async fn state(&self) -> SessionState {
        self.shared.inner.lock().await.state
    }

    pub async fn group_name(&self) -> Option<String> {
        self.shared.inner.lock().await.group.clone()
    }

    /// Join `config.group_name`. A rejection is a normal outcome, not an error.
    pub async fn join(&self, config: JoiningConfig) -> Result<JoinDecision, ClientError> {
        config.validate()?;

        let (token, generation) = {
            let mut inner = self.shared.inner.lock().await;
            match inner.state {
                SessionState::Disconnected => {}
                SessionState::Disposed => return Err(ClientError::Disposed),
                state => return Err(ClientError::InvalidState { operation: "join", state }),
            }
            let token = self.disposed.child_token();
            inner.state = SessionState::Joining;
            inner.join_cancel = Some(token.clone());
            inner.join_generation += 1;
            (token, inner.join_generation)
        };

        let request = Request::Join {
            client_id: self.client_id.clone(),
            group_name: config.group_name.clone(),
            max_capacity: config.max_capacity,
        };
        let outcome = async {
            self.ensure_channel().await?;
            self.shared.adapter.request(request).await?.into_join().map_err(ClientError::from)
        };
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(self.cancellation()),
            outcome = outcome => outcome,
        };

        let mut inner = self.shared.inner.lock().await;
        if inner.state != SessionState::Joining || inner.join_generation != generation {
            // leave(), dispose() or a newer join already moved us on.
            return match result {
                Err(e) => Err(e),
                Ok(_) => Err(self.cancellation()),
            };
        }
        inner.join_cancel = None;
        match result {
            Ok(JoinDecision::Approved) => {
                inner.state = SessionState::Joined;
                inner.group = Some(config.group_name.clone());
                drop(inner);
                log::info!("{} joined {}", self.client_id, config.group_name);
                self.shared.emit_event(SessionEvent::Joined(self.client_id.clone()));
                Ok(JoinDecision::Approved)
            }
            Ok(JoinDecision::Rejected) => {
                inner.state = SessionState::Disconnected;
                drop(inner);
                log::info!("{} was rejected by {}", self.client_id, config.group_name);
                self.shared.emit_event(SessionEvent::JoinRejected);
                Ok(JoinDecision::Rejected)
            }
            Err(e) => {
                inner.state = SessionState::Disconnected;
                drop(inner);
                log::warn!("Join of {} failed: {e}", config.group_name);
                Err(e)
            }
        }
    }

    /// Leave the current group. No-op when not in one.
    pub async fn leave(&self) -> Result<(), ClientError> {
        {
            let mut inner = self.shared.inner.lock().await;
            match inner.state {
                SessionState::Disconnected | SessionState::Disposed | SessionState::Leaving => {
                    return Ok(())
                }
                SessionState::Joining | SessionState::Joined => {}
            }
            if let Some(token) = inner.join_cancel.take() {
                token.cancel();
            }
            inner.state = SessionState::Leaving;
        }

        if let Err(e) = self.shared.adapter.emit(Request::Leave).await {
            log::debug!("Leave notification not sent: {e}");
        }
        self.shared.adapter.close().await;

        let forwarder = {
            let mut inner = self.shared.inner.lock().await;
            if inner.state == SessionState::Leaving {
                inner.state = SessionState::Disconnected;
            }
            inner.group = None;
            inner.forwarder.take()
        };
        if let Some(forwarder) = forwarder {
            forwarder.abort();
        }
        self.shared.emit_event(SessionEvent::Leaving(LEAVE_REQUEST.to_string()));
        Ok(())
    }

    /// Broadcast to the group, or address one member with `to`.
    pub async fn send_message(&self, content: &str, to: Option<&str>) -> Result<(), ClientError> {
        match self.state().await {
            SessionState::Joined => {}
            SessionState::Disposed => return Err(ClientError::Disposed),
            _ => return Err(ClientError::NotJoined),
        }
        let message = Message {
            from: self.client_id.clone(),
            to: to.map(str::to_string),
            message_content: content.to_string(),
        };
        self.shared.adapter.emit(Request::Message(message)).await
    }

    pub async fn list_groups(&self) -> Result<ListGroupsResponse, ClientError> {
        Ok(self.call(Request::ListGroups).await?.into_groups()?)
    }

    /// 409 in the response status is a normal outcome.
    pub async fn create_group(
        &self,
        group_name: &str,
        max_capacity: u32,
    ) -> Result<CreateGroupResponse, ClientError> {
        let request = Request::CreateGroup {
            group_name: group_name.to_string(),
            max_capacity,
        };
        Ok(self.call(request).await?.into_created()?)
    }

    pub async fn delete_group(&self, group_name: &str) -> Result<u16, ClientError> {
        let request = Request::DeleteGroup {
            group_name: group_name.to_string(),
        };
        Ok(self.call(request).await?.into_status()?)
    }

    /// Cancel every wait, stop event forwarding and release the transport.
    /// Safe to call more than once.
    pub async fn dispose(&self) {
        let forwarder = {
            let mut inner = self.shared.inner.lock().await;
            if inner.state == SessionState::Disposed {
                return;
            }
            inner.state = SessionState::Disposed;
            inner.group = None;
            inner.join_cancel = None;
            self.disposed.cancel();
            inner.forwarder.take()
        };
        if let Some(forwarder) = forwarder {
            forwarder.abort();
        }
        self.shared.adapter.release().await;
        log::debug!("Session {} disposed", self.client_id);
    }

    /// Request on the shared channel, opening it if needed.
    async fn call(&self, request: Request) -> Result<Reply, ClientError> {
        if self.state().await == SessionState::Disposed {
            return Err(ClientError::Disposed);
        }
        self.until_disposed(async {
            self.ensure_channel().await?;
            self.shared.adapter.request(request).await
        })
        .await
    }

    async fn until_disposed<T>(
        &self,
        fut: impl Future<Output = Result<T, ClientError>>,
    ) -> Result<T, ClientError> {
        tokio::select! {
            biased;
            _ = self.disposed.cancelled() => Err(ClientError::Disposed),
            result = fut => result,
        }
    }

    fn cancellation(&self) -> ClientError {
        if self.disposed.is_cancelled() {
            ClientError::Disposed
        } else {
            ClientError::Cancelled
        }
    }

    /// Open (or reuse) the channel; a fresh one gets a new forwarding task.
    async fn ensure_channel(&self) -> Result<(), ClientError> {
        if let Some(events) = self.shared.adapter.open().await? {
            let task = tokio::spawn(forward_events(self.shared.clone(), events));
            let mut inner = self.shared.inner.lock().await;
            if inner.state == SessionState::Disposed {
                task.abort();
                return Err(ClientError::Disposed);
            }
            if let Some(previous) = inner.forwarder.replace(task) {
                previous.abort();
            }
        }
        Ok(())
    }
}

/// Turn channel events into session events and react to the ones that end
/// group membership.
async fn forward_events(shared: Arc<Shared>, mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Server(ServerEvent::MemberJoined(client_id)) => {
                shared.emit_event(SessionEvent::ClientJoined(client_id));
            }
            ChannelEvent::Server(ServerEvent::MemberLeaving(client_id)) => {
                shared.emit_event(SessionEvent::ClientLeaving(client_id));
            }
            ChannelEvent::Server(ServerEvent::Message(message)) => {
                shared.emit_event(SessionEvent::MessageReceived {
                    from: message.from,
                    content: message.message_content,
                });
            }
            ChannelEvent::Server(ServerEvent::GroupDeleted) => {
                {
                    let mut inner = shared.inner.lock().await;
                    if inner.state != SessionState::Joined {
                        continue;
                    }
                    inner.state = SessionState::Leaving;
                }
                log::info!("Group deleted, leaving");
                shared.emit_event(SessionEvent::Leaving(GROUP_DELETED.to_string()));
                if let Err(e) = shared.adapter.emit(Request::Leave).await {
                    log::debug!("Leave notification not sent: {e}");
                }
                shared.adapter.close().await;
                let mut inner = shared.inner.lock().await;
                if inner.state == SessionState::Leaving {
                    inner.state = SessionState::Disconnected;
                    inner.group = None;
                }
                // The closed channel yields nothing more.
                inner.forwarder = None;
                return;
            }
            ChannelEvent::Disconnected(reason) => {
                let was_member = {
                    let mut inner = shared.inner.lock().await;
                    match inner.state {
                        SessionState::Joined => {
                            inner.state = SessionState::Disconnected;
                            inner.group = None;
                            true
                        }
                        // A pending join fails on its own once the channel
                        // drops its waiters.
                        SessionState::Joining => {
                            log::debug!("Channel dropped during join: {reason}");
                            false
                        }
                        _ => false,
                    }
                };
                if was_member {
                    log::warn!("Unexpectedly left: {reason}");
                    shared.emit_event(SessionEvent::UnexpectedLeft(reason));
                }
            }
        }
    }
}
