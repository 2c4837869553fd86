//! Integration tests for the WebSocket group server.
//!
//! These tests start a real server on a free port and drive it with raw
//! WebSocket peers speaking the binary frame protocol.

use futures_util::{SinkExt, StreamExt};
use async_trait::async_trait;
use huddle_core::{
    ChannelHandle, ClientFrame, JoinDecision, Message, Reply, Request, ServerEvent, ServerFrame, STATUS_CONFLICT,
    STATUS_OK,
};
use huddle_server::{
    GroupServer, PresenceSource, ServerConfig, SharedGroupStore, StoreBackend, StoreError,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn start_server_with(presence: PresenceSource) -> u16 {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        store: StoreBackend::Memory,
        presence,
        outbound_capacity: 64,
        ..ServerConfig::default()
    };
    let server = GroupServer::connect(config).await.unwrap();
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

async fn start_test_server() -> u16 {
    start_server_with(PresenceSource::Transport).await
}

/// A bare protocol peer.
struct Peer {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    next_ack: u64,
    /// Events that arrived while waiting for an ack
    backlog: Vec<ServerEvent>,
}

impl Peer {
    async fn connect(port: u16) -> Self {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}"))
            .await
            .unwrap();
        Self { ws, next_ack: 1, backlog: Vec::new() }
    }

    async fn emit(&mut self, request: Request) {
        let frame = ClientFrame { ack: None, request };
        self.ws
            .send(WsMessage::Binary(frame.encode().unwrap().into()))
            .await
            .unwrap();
    }

    async fn call(&mut self, request: Request) -> Reply {
        let ack = self.next_ack;
        self.next_ack += 1;
        let frame = ClientFrame { ack: Some(ack), request };
        self.ws
            .send(WsMessage::Binary(frame.encode().unwrap().into()))
            .await
            .unwrap();

        loop {
            match self.next_frame(Duration::from_secs(2)).await {
                Some(ServerFrame::Ack { ack: got, reply }) if got == ack => return reply,
                Some(ServerFrame::Ack { ack: got, .. }) => panic!("Unexpected ack {got}"),
                Some(ServerFrame::Event(event)) => self.backlog.push(event),
                None => panic!("No reply within timeout"),
            }
        }
    }

    async fn join(&mut self, client_id: &str, group: &str, cap: Option<u32>) -> JoinDecision {
        self.call(Request::Join {
            client_id: client_id.into(),
            group_name: group.into(),
            max_capacity: cap,
        })
        .await
        .into_join()
        .unwrap()
    }

    async fn next_frame(&mut self, wait: Duration) -> Option<ServerFrame> {
        loop {
            match timeout(wait, self.ws.next()).await {
                Ok(Some(Ok(WsMessage::Binary(data)))) => {
                    return Some(ServerFrame::decode(&data).unwrap());
                }
                Ok(Some(Ok(_))) => continue,
                _ => return None,
            }
        }
    }

    /// All events received within `wait`, backlog first.
    async fn drain(&mut self, wait: Duration) -> Vec<ServerEvent> {
        let mut events = std::mem::take(&mut self.backlog);
        while let Some(frame) = self.next_frame(wait).await {
            match frame {
                ServerFrame::Event(event) => events.push(event),
                other => panic!("Unexpected frame {other:?}"),
            }
        }
        events
    }

    async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

const QUIET: Duration = Duration::from_millis(150);

#[tokio::test]
async fn test_server_accepts_connections() {
    let port = start_test_server().await;
    let result = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}")).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_lobby_capacity_scenario() {
    let port = start_test_server().await;
    let mut a = Peer::connect(port).await;
    let mut b = Peer::connect(port).await;
    let mut c = Peer::connect(port).await;

    assert_eq!(a.join("A", "lobby", Some(2)).await, JoinDecision::Approved);
    assert_eq!(b.join("B", "lobby", Some(2)).await, JoinDecision::Approved);
    assert_eq!(c.join("C", "lobby", Some(2)).await, JoinDecision::Rejected);

    assert_eq!(a.drain(QUIET).await, vec![ServerEvent::MemberJoined("B".into())]);

    a.emit(Request::Leave).await;
    assert_eq!(b.drain(QUIET).await, vec![ServerEvent::MemberLeaving("A".into())]);

    assert_eq!(c.join("C", "lobby", Some(2)).await, JoinDecision::Approved);
    assert_eq!(b.drain(QUIET).await, vec![ServerEvent::MemberJoined("C".into())]);
}

#[tokio::test]
async fn test_create_group_twice() {
    let port = start_test_server().await;
    let mut a = Peer::connect(port).await;

    let first = a
        .call(Request::CreateGroup { group_name: "room1".into(), max_capacity: 4 })
        .await
        .into_created()
        .unwrap();
    assert_eq!(first.status, STATUS_OK);
    assert_eq!(first.message, "Group have been created. groupName: room1");

    let second = a
        .call(Request::CreateGroup { group_name: "room1".into(), max_capacity: 4 })
        .await
        .into_created()
        .unwrap();
    assert_eq!(second.status, STATUS_CONFLICT);
    assert_eq!(second.message, "Group already exists. groupName: room1");

    let listed = a.call(Request::ListGroups).await.into_groups().unwrap();
    assert_eq!(listed.groups.len(), 1);
    assert_eq!(listed.groups[0].name, "room1");
}

#[tokio::test]
async fn test_messages_are_routed() {
    let port = start_test_server().await;
    let mut a = Peer::connect(port).await;
    let mut b = Peer::connect(port).await;
    let mut c = Peer::connect(port).await;
    a.join("A", "lobby", None).await;
    b.join("B", "lobby", None).await;
    c.join("C", "lobby", None).await;
    a.drain(QUIET).await;
    b.drain(QUIET).await;
    c.drain(QUIET).await;

    a.emit(Request::Message(Message::broadcast("hi all"))).await;
    for peer in [&mut b, &mut c] {
        let events = peer.drain(QUIET).await;
        assert!(
            matches!(&events[..], [ServerEvent::Message(m)] if m.from == "A" && m.message_content == "hi all"),
            "Unexpected events {events:?}"
        );
    }
    assert!(a.drain(QUIET).await.is_empty());

    a.emit(Request::Message(Message::direct("C", "only you"))).await;
    let events = c.drain(QUIET).await;
    assert!(matches!(&events[..], [ServerEvent::Message(m)] if m.to.as_deref() == Some("C")));
    assert!(b.drain(QUIET).await.is_empty());

    // Unmapped target: nothing arrives, the connection stays usable.
    a.emit(Request::Message(Message::direct("X", "void"))).await;
    assert!(b.drain(QUIET).await.is_empty());
    assert!(c.drain(QUIET).await.is_empty());
    assert!(a.call(Request::ListGroups).await.into_groups().is_ok());
}

#[tokio::test]
async fn test_disconnect_broadcasts_leaving_and_prunes() {
    let port = start_test_server().await;
    let mut a = Peer::connect(port).await;
    let mut b = Peer::connect(port).await;
    a.join("A", "lobby", Some(2)).await;
    b.join("B", "lobby", Some(2)).await;
    a.drain(QUIET).await;

    b.close().await;
    assert_eq!(a.drain(QUIET).await, vec![ServerEvent::MemberLeaving("B".into())]);

    // B's seat is free again.
    let mut c = Peer::connect(port).await;
    assert_eq!(c.join("C", "lobby", Some(2)).await, JoinDecision::Approved);

    a.close().await;
    c.close().await;
    tokio::time::sleep(QUIET).await;

    let mut observer = Peer::connect(port).await;
    let listed = observer.call(Request::ListGroups).await.into_groups().unwrap();
    assert!(listed.groups.is_empty(), "Empty group should be pruned: {listed:?}");
}

#[tokio::test]
async fn test_delete_group_notifies_members() {
    let port = start_test_server().await;
    let mut a = Peer::connect(port).await;
    let mut b = Peer::connect(port).await;
    let mut admin = Peer::connect(port).await;
    a.join("A", "doomed", None).await;
    b.join("B", "doomed", None).await;
    a.drain(QUIET).await;

    let status = admin
        .call(Request::DeleteGroup { group_name: "doomed".into() })
        .await
        .into_status()
        .unwrap();
    assert_eq!(status, STATUS_OK);

    assert_eq!(a.drain(QUIET).await, vec![ServerEvent::GroupDeleted]);
    assert_eq!(b.drain(QUIET).await, vec![ServerEvent::GroupDeleted]);
}

#[tokio::test]
async fn test_store_presence_end_to_end() {
    let port = start_server_with(PresenceSource::Store).await;
    let mut a = Peer::connect(port).await;
    let mut b = Peer::connect(port).await;

    assert_eq!(a.join("A", "pair", Some(1)).await, JoinDecision::Approved);
    assert_eq!(b.join("B", "pair", Some(1)).await, JoinDecision::Rejected);

    a.close().await;
    tokio::time::sleep(QUIET).await;
    assert_eq!(b.join("B", "pair", Some(1)).await, JoinDecision::Approved);
}

#[tokio::test]
async fn test_malformed_frame_is_ignored() {
    let port = start_test_server().await;
    let mut a = Peer::connect(port).await;

    a.ws
        .send(WsMessage::Binary(vec![0xff, 0xfe, 0xfd].into()))
        .await
        .unwrap();
    // The connection survives and keeps answering.
    let listed = a.call(Request::ListGroups).await.into_groups().unwrap();
    assert!(listed.groups.is_empty());
}

#[tokio::test]
async fn test_leave_with_ack_is_acknowledged() {
    let port = start_test_server().await;
    let mut a = Peer::connect(port).await;
    a.join("A", "lobby", None).await;
    assert_eq!(a.call(Request::Leave).await, Reply::Status(STATUS_OK));
}

/// A store whose backend is unreachable.
struct DownStore;

fn down() -> StoreError {
    StoreError::InvalidCapacity { key: "backend".into(), value: "unreachable".into() }
}

#[async_trait]
impl SharedGroupStore for DownStore {
    async fn group_list(&self) -> Result<BTreeMap<String, String>, StoreError> {
        Err(down())
    }

    async fn set_group_list(&self, _groups: &BTreeMap<String, String>) -> Result<(), StoreError> {
        Err(down())
    }

    async fn max_capacity(&self, _group_name: &str) -> Result<Option<u32>, StoreError> {
        Err(down())
    }

    async fn set_max_capacity(&self, _group_name: &str, _capacity: u32) -> Result<(), StoreError> {
        Err(down())
    }

    async fn client_handle(&self, _client_id: &str) -> Result<Option<ChannelHandle>, StoreError> {
        Err(down())
    }

    async fn set_client_handle(
        &self,
        _client_id: &str,
        _handle: &ChannelHandle,
    ) -> Result<(), StoreError> {
        Err(down())
    }

    async fn remove_client_handle(&self, _client_id: &str) -> Result<(), StoreError> {
        Err(down())
    }

    async fn add_member(&self, _group_name: &str, _handle: &ChannelHandle) -> Result<(), StoreError> {
        Err(down())
    }

    async fn remove_member(
        &self,
        _group_name: &str,
        _handle: &ChannelHandle,
    ) -> Result<(), StoreError> {
        Err(down())
    }

    async fn members(&self, _group_name: &str) -> Result<BTreeSet<ChannelHandle>, StoreError> {
        Err(down())
    }
}

#[tokio::test]
async fn test_store_failure_fails_only_the_request() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = Arc::new(GroupServer::new(ServerConfig::default(), Arc::new(DownStore)));
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });

    let mut a = Peer::connect(port).await;
    assert!(matches!(a.call(Request::ListGroups).await, Reply::Error(_)));
    let join = a
        .call(Request::Join {
            client_id: "A".into(),
            group_name: "lobby".into(),
            max_capacity: Some(2),
        })
        .await;
    match join {
        Reply::Error(message) => assert!(message.contains("unreachable"), "{message}"),
        other => panic!("Expected an error reply, got {other:?}"),
    }

    // The connection survives and serves requests that need no store.
    let status = a.call(Request::DeleteGroup { group_name: "lobby".into() }).await;
    assert_eq!(status, Reply::Status(STATUS_OK));

    let stats = server.stats().await;
    assert_eq!(stats.store_errors, 2);
    assert_eq!(stats.active_connections, 1);
    a.close().await;
}
