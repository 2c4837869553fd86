use std::time::Duration;

use huddle_core::ProtocolError;

use crate::session::SessionState;

/// Client errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Cannot {operation} while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
    #[error("Not joined to a group")]
    NotJoined,
    #[error("Session has been disposed")]
    Disposed,
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Connection not established within {0:?}")]
    ConnectionTimeout(Duration),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Channel is not connected")]
    NotConnected,
    #[error("Channel closed before the reply arrived")]
    ChannelClosed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Bridge error: {0}")]
    Bridge(String),
    #[error("Bridge payload error: {0}")]
    Json(#[from] serde_json::Error),
}
