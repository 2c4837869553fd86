//! Shared key-value state for group admission.
//!
//! Every server process reads and writes the same keys, which is how
//! independent processes agree on capacities, routing and the directory:
//!
//! ```text
//! ┌──────────────────────┬───────────────────────────────────────┐
//! │ key                  │ value                                 │
//! ├──────────────────────┼───────────────────────────────────────┤
//! │ GroupList            │ JSON object  group name → id          │
//! │ MaxCapacity#<group>  │ integer string                        │
//! │ <clientId>           │ channel handle                        │
//! │ Members#<group>      │ set of channel handles (store presence)│
//! └──────────────────────┴───────────────────────────────────────┘
//! ```
//!
//! All entries are read-modify-write without concurrency control; the last
//! writer wins.

pub mod memory;
pub mod redis;

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use huddle_core::ChannelHandle;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Key of the serialized group directory.
pub const GROUP_LIST_KEY: &str = "GroupList";

/// Group name → representative channel id.
pub type GroupDirectory = BTreeMap<String, String>;

pub fn max_capacity_key(group_name: &str) -> String {
    format!("MaxCapacity#{group_name}")
}

pub fn members_key(group_name: &str) -> String {
    format!("Members#{group_name}")
}

/// Client ids share the keyspace with the directory and per-group records,
/// so an id that names one of those keys cannot be mapped.
pub fn is_reserved_key(client_id: &str) -> bool {
    client_id == GROUP_LIST_KEY
        || client_id.starts_with("MaxCapacity#")
        || client_id.starts_with("Members#")
}

/// Store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("Corrupt group directory: {0}")]
    Directory(#[from] serde_json::Error),
    #[error("Invalid capacity for {key}: {value:?}")]
    InvalidCapacity { key: String, value: String },
}

/// Key-value operations shared by all server processes.
#[async_trait]
pub trait SharedGroupStore: Send + Sync {
    async fn group_list(&self) -> Result<GroupDirectory, StoreError>;

    async fn set_group_list(&self, groups: &GroupDirectory) -> Result<(), StoreError>;

    /// Persisted capacity of `group_name`. Zero is treated as unbounded.
    async fn max_capacity(&self, group_name: &str) -> Result<Option<u32>, StoreError>;

    async fn set_max_capacity(&self, group_name: &str, capacity: u32) -> Result<(), StoreError>;

    async fn client_handle(&self, client_id: &str) -> Result<Option<ChannelHandle>, StoreError>;

    async fn set_client_handle(
        &self,
        client_id: &str,
        handle: &ChannelHandle,
    ) -> Result<(), StoreError>;

    async fn remove_client_handle(&self, client_id: &str) -> Result<(), StoreError>;

    async fn add_member(&self, group_name: &str, handle: &ChannelHandle) -> Result<(), StoreError>;

    async fn remove_member(&self, group_name: &str, handle: &ChannelHandle)
        -> Result<(), StoreError>;

    async fn members(&self, group_name: &str) -> Result<BTreeSet<ChannelHandle>, StoreError>;
}

pub(crate) fn encode_directory(groups: &GroupDirectory) -> Result<String, StoreError> {
    Ok(serde_json::to_string(groups)?)
}

pub(crate) fn decode_directory(raw: Option<&str>) -> Result<GroupDirectory, StoreError> {
    match raw {
        Some(raw) if !raw.is_empty() => Ok(serde_json::from_str(raw)?),
        _ => Ok(GroupDirectory::new()),
    }
}

pub(crate) fn parse_capacity(key: &str, raw: Option<&str>) -> Result<Option<u32>, StoreError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let capacity: u32 = raw.trim().parse().map_err(|_| StoreError::InvalidCapacity {
        key: key.to_string(),
        value: raw.to_string(),
    })?;
    Ok((capacity > 0).then_some(capacity))
}
