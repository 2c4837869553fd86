//! Client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ClientError;

/// How to reach the group server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// WebSocket URL of the group server
    pub url: String,
    /// Upper bound on establishing the channel
    pub connection_timeout: Duration,
    /// Channel events buffered before the reader waits
    pub event_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:3030".to_string(),
            connection_timeout: Duration::from_secs(10),
            event_buffer: 256,
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Reject configurations that cannot work before any I/O happens.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.url.trim().is_empty() {
            return Err(ClientError::InvalidConfig("url must not be empty".into()));
        }
        if self.connection_timeout.is_zero() {
            return Err(ClientError::InvalidConfig(
                "connection timeout must be positive".into(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(ClientError::InvalidConfig(
                "event buffer must hold at least one event".into(),
            ));
        }
        Ok(())
    }
}

/// Which group to join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoiningConfig {
    pub group_name: String,
    /// Applied only when the group has no capacity record yet
    pub max_capacity: Option<u32>,
}

impl JoiningConfig {
    pub fn new(group_name: impl Into<String>) -> Self {
        Self {
            group_name: group_name.into(),
            max_capacity: None,
        }
    }

    pub fn with_max_capacity(mut self, max_capacity: u32) -> Self {
        self.max_capacity = Some(max_capacity);
        self
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.group_name.trim().is_empty() {
            return Err(ClientError::InvalidConfig("group name must not be empty".into()));
        }
        Ok(())
    }
}
