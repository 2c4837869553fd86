//! Bridge binding for clients hosted inside an embedded runtime.
//!
//! The host can only talk to the embedded side through named actions and
//! named callbacks that each carry one string payload plus the `instanceId`
//! of the session they belong to:
//!
//! ```text
//!  host                                         embedded runtime
//!  ────                                         ────────────────
//!  BridgeTransport ── action(name, json, id) ──► EmbeddedAdapter
//!                                                  └─ NativeTransport per id
//!  BridgeRouter ◄──── callback(name, json, id) ───┘
//!    └─ routes to the BridgeTransport with that id
//! ```
//!
//! Calls that wait for an answer carry a `callId`; the embedded side echoes
//! it in its `Complete` callback so concurrent calls on one instance never
//! get each other's replies.

pub mod embedded;
pub mod host;

pub use embedded::{EmbeddedAdapter, LoopbackRuntime};
pub use host::{BridgeRouter, BridgeTransport, EmbeddedRuntime};

use async_trait::async_trait;
use huddle_core::Reply;
use serde::{Deserialize, Serialize};

/// Host → embedded actions.
pub mod action {
    /// Payload: `ClientConfig` JSON
    pub const CREATE: &str = "BridgeTransport#Create";
    /// Payload: `BridgeCall<()>`
    pub const OPEN: &str = "BridgeTransport#Open";
    pub const CLOSE: &str = "BridgeTransport#Close";
    /// Payload: `BridgeCall<Request>`
    pub const REQUEST: &str = "BridgeTransport#Request";
    /// Payload: `Request` JSON
    pub const EMIT: &str = "BridgeTransport#Emit";
    pub const RELEASE: &str = "BridgeTransport#Release";
}

/// Embedded → host callbacks.
pub mod callback {
    /// Payload: `BridgeCompletion`
    pub const COMPLETE: &str = "BridgeTransport#Complete";
    /// Payload: `ServerEvent` JSON
    pub const EVENT: &str = "BridgeTransport#Event";
    /// Payload: the raw disconnect reason
    pub const DISCONNECTED: &str = "BridgeTransport#Disconnected";
}

/// A call that expects a [`BridgeCompletion`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeCall<T> {
    pub call_id: u64,
    pub body: T,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BridgeOutcome {
    Opened { fresh: bool },
    Reply(Reply),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeCompletion {
    pub call_id: u64,
    pub outcome: BridgeOutcome,
}

/// Receiving end of the embedded side's callbacks.
#[async_trait]
pub trait HostCallback: Send + Sync {
    async fn callback(&self, name: &str, payload: String, instance_id: &str);
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_core::{JoinDecision, Request};

    #[test]
    fn test_bridge_call_json_shape() {
        let call = BridgeCall {
            call_id: 3,
            body: Request::Join {
                client_id: "A".into(),
                group_name: "lobby".into(),
                max_capacity: Some(2),
            },
        };
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["callId"], 3);
        assert_eq!(json["body"]["join"]["groupName"], "lobby");
    }

    #[test]
    fn test_completion_from_json() {
        let raw = r#"{"callId":9,"outcome":{"reply":{"join":"rejected"}}}"#;
        let completion: BridgeCompletion = serde_json::from_str(raw).unwrap();
        assert_eq!(completion.call_id, 9);
        assert_eq!(
            completion.outcome,
            BridgeOutcome::Reply(Reply::Join(JoinDecision::Rejected))
        );
    }
}
