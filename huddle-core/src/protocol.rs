//! Group messaging wire protocol.
//!
//! Every event of the protocol is a variant of a closed enum, decoded once at
//! ingress:
//!
//! ```text
//! client ──ClientFrame{ack?, Request}──►  server
//! client ◄──ServerFrame::Ack{ack, Reply}── server   (request/response)
//! client ◄──ServerFrame::Event(ServerEvent)── server (presence, messages)
//! ```
//!
//! Frames are bincode-encoded and travel as binary WebSocket messages. The
//! same types are JSON-encoded on the embedded-runtime bridge, so field names
//! follow the camelCase shape clients already expect (`messageContent`,
//! `groupName`, ...).

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// HTTP-style status for a successful create/delete.
pub const STATUS_OK: u16 = 200;
/// HTTP-style status for a duplicate group name.
pub const STATUS_CONFLICT: u16 = 409;

/// Transport-level identifier of one connected channel.
///
/// Distinct from the application-level client id: a client keeps its id
/// across reconnects, a handle lives exactly as long as one connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelHandle(String);

impl ChannelHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    /// Fresh random handle for a newly accepted connection.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Message envelope.
///
/// `to` set means unicast, absent (or empty) means broadcast to the sender's
/// group. `from` is always rewritten by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: Option<String>,
    pub message_content: String,
}

impl Message {
    pub fn broadcast(content: impl Into<String>) -> Self {
        Self {
            from: String::new(),
            to: None,
            message_content: content.into(),
        }
    }

    pub fn direct(to: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            from: String::new(),
            to: Some(to.into()),
            message_content: content.into(),
        }
    }

    /// Unicast target, treating an empty string like an absent one.
    pub fn target(&self) -> Option<&str> {
        self.to.as_deref().filter(|to| !to.is_empty())
    }
}

/// One entry of the group directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    /// Representative channel handle (creator or first joiner)
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListGroupsResponse {
    pub groups: Vec<GroupInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateGroupResponse {
    pub status: u16,
    pub message: String,
}

impl CreateGroupResponse {
    pub fn created(group_name: &str) -> Self {
        Self {
            status: STATUS_OK,
            message: format!("Group have been created. groupName: {group_name}"),
        }
    }

    pub fn conflict(group_name: &str) -> Self {
        Self {
            status: STATUS_CONFLICT,
            message: format!("Group already exists. groupName: {group_name}"),
        }
    }

    pub fn is_created(&self) -> bool {
        self.status == STATUS_OK
    }
}

/// Outcome of admission control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinDecision {
    Approved,
    Rejected,
}

impl JoinDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for JoinDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client → server operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Request {
    ListGroups,
    CreateGroup {
        group_name: String,
        max_capacity: u32,
    },
    DeleteGroup {
        group_name: String,
    },
    Join {
        client_id: String,
        group_name: String,
        max_capacity: Option<u32>,
    },
    Leave,
    Message(Message),
}

impl Request {
    /// Protocol event name, as listed in the event table.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::ListGroups => "list groups",
            Self::CreateGroup { .. } => "create group",
            Self::DeleteGroup { .. } => "delete group",
            Self::Join { .. } => "join",
            Self::Leave => "leave",
            Self::Message(_) => "message",
        }
    }

    /// Whether the server answers this request with an ack.
    pub fn expects_reply(&self) -> bool {
        matches!(
            self,
            Self::ListGroups | Self::CreateGroup { .. } | Self::DeleteGroup { .. } | Self::Join { .. }
        )
    }
}

/// Server → client acknowledgement payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Reply {
    Groups(ListGroupsResponse),
    Created(CreateGroupResponse),
    Status(u16),
    Join(JoinDecision),
    /// The operation failed server-side (store or transport failure).
    Error(String),
}

impl Reply {
    fn kind(&self) -> &'static str {
        match self {
            Self::Groups(_) => "groups",
            Self::Created(_) => "created",
            Self::Status(_) => "status",
            Self::Join(_) => "join",
            Self::Error(_) => "error",
        }
    }

    fn unexpected(self, expected: &'static str) -> ProtocolError {
        match self {
            Self::Error(reason) => ProtocolError::Remote(reason),
            other => ProtocolError::UnexpectedReply {
                expected,
                got: other.kind(),
            },
        }
    }

    pub fn into_groups(self) -> Result<ListGroupsResponse, ProtocolError> {
        match self {
            Self::Groups(groups) => Ok(groups),
            other => Err(other.unexpected("groups")),
        }
    }

    pub fn into_created(self) -> Result<CreateGroupResponse, ProtocolError> {
        match self {
            Self::Created(response) => Ok(response),
            other => Err(other.unexpected("created")),
        }
    }

    pub fn into_status(self) -> Result<u16, ProtocolError> {
        match self {
            Self::Status(status) => Ok(status),
            other => Err(other.unexpected("status")),
        }
    }

    pub fn into_join(self) -> Result<JoinDecision, ProtocolError> {
        match self {
            Self::Join(decision) => Ok(decision),
            other => Err(other.unexpected("join")),
        }
    }
}

/// Server → client pushes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ServerEvent {
    MemberJoined(String),
    MemberLeaving(String),
    Message(Message),
    GroupDeleted,
}

impl ServerEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::MemberJoined(_) => "member joined",
            Self::MemberLeaving(_) => "member leaving",
            Self::Message(_) => "message",
            Self::GroupDeleted => "group deleted",
        }
    }
}

/// Frame sent by clients. `ack` is present when a reply is awaited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientFrame {
    pub ack: Option<u64>,
    pub request: Request,
}

impl ClientFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

/// Frame sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerFrame {
    Ack { ack: u64, reply: Reply },
    Event(ServerEvent),
}

impl ServerFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Unexpected reply: expected {expected}, got {got}")]
    UnexpectedReply {
        expected: &'static str,
        got: &'static str,
    },
    #[error("Remote error: {0}")]
    Remote(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_frame_roundtrip() {
        let frame = ClientFrame {
            ack: Some(7),
            request: Request::Join {
                client_id: "alice".into(),
                group_name: "lobby".into(),
                max_capacity: Some(2),
            },
        };
        let decoded = ClientFrame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_event_frame_roundtrip() {
        let mut message = Message::direct("bob", "hi");
        message.from = "alice".into();
        let frame = ServerFrame::Event(ServerEvent::Message(message));
        let decoded = ServerFrame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(ClientFrame::decode(&garbage).is_err());
        assert!(ServerFrame::decode(&garbage).is_err());
    }

    #[test]
    fn test_event_names() {
        assert_eq!(Request::ListGroups.event_name(), "list groups");
        assert_eq!(Request::Leave.event_name(), "leave");
        assert_eq!(
            Request::DeleteGroup { group_name: "x".into() }.event_name(),
            "delete group"
        );
        assert_eq!(ServerEvent::GroupDeleted.event_name(), "group deleted");
        assert_eq!(ServerEvent::MemberLeaving("a".into()).event_name(), "member leaving");
    }

    #[test]
    fn test_expects_reply() {
        assert!(Request::ListGroups.expects_reply());
        assert!(!Request::Leave.expects_reply());
        assert!(!Request::Message(Message::broadcast("x")).expects_reply());
    }

    #[test]
    fn test_message_target_ignores_empty() {
        assert_eq!(Message::direct("", "x").target(), None);
        assert_eq!(Message::direct("bob", "x").target(), Some("bob"));
        assert_eq!(Message::broadcast("x").target(), None);
    }

    #[test]
    fn test_message_json_shape() {
        let json = serde_json::to_value(Message::direct("bob", "hello")).unwrap();
        assert_eq!(json["messageContent"], "hello");
        assert_eq!(json["to"], "bob");

        let parsed: Message = serde_json::from_str(r#"{"messageContent":"x"}"#).unwrap();
        assert_eq!(parsed.from, "");
        assert_eq!(parsed.to, None);
    }

    #[test]
    fn test_join_decision_json() {
        assert_eq!(serde_json::to_string(&JoinDecision::Approved).unwrap(), "\"approved\"");
        assert_eq!(JoinDecision::Rejected.to_string(), "rejected");
    }

    #[test]
    fn test_create_group_responses() {
        let created = CreateGroupResponse::created("room1");
        assert!(created.is_created());
        assert_eq!(created.message, "Group have been created. groupName: room1");

        let conflict = CreateGroupResponse::conflict("room1");
        assert_eq!(conflict.status, STATUS_CONFLICT);
        assert!(conflict.message.starts_with("Group already exists."));
    }

    #[test]
    fn test_reply_conversions() {
        assert_eq!(Reply::Join(JoinDecision::Approved).into_join().unwrap(), JoinDecision::Approved);
        assert_eq!(Reply::Status(200).into_status().unwrap(), 200);

        let err = Reply::Status(200).into_join().unwrap_err();
        assert_eq!(err, ProtocolError::UnexpectedReply { expected: "join", got: "status" });

        let err = Reply::Error("store down".into()).into_groups().unwrap_err();
        assert_eq!(err, ProtocolError::Remote("store down".into()));
    }

    #[test]
    fn test_channel_handle_generate_unique() {
        let a = ChannelHandle::generate();
        let b = ChannelHandle::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
    }
}
