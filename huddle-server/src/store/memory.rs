//! In-process store for single-node deployments and tests.
//!
//! Keeps the exact key layout of the shared store so the two bindings are
//! interchangeable.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use huddle_core::ChannelHandle;
use tokio::sync::RwLock;

use super::{
    decode_directory, encode_directory, max_capacity_key, members_key, parse_capacity,
    GroupDirectory, SharedGroupStore, StoreError, GROUP_LIST_KEY,
};

#[derive(Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, String>>,
    sets: RwLock<HashMap<String, BTreeSet<ChannelHandle>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw string value stored under `key`.
    pub async fn get_raw(&self, key: &str) -> Option<String> {
        self.values.read().await.get(key).cloned()
    }

    pub async fn set_raw(&self, key: &str, value: impl Into<String>) {
        self.values.write().await.insert(key.to_string(), value.into());
    }
}

#[async_trait]
impl SharedGroupStore for MemoryStore {
    async fn group_list(&self) -> Result<GroupDirectory, StoreError> {
        let values = self.values.read().await;
        decode_directory(values.get(GROUP_LIST_KEY).map(String::as_str))
    }

    async fn set_group_list(&self, groups: &GroupDirectory) -> Result<(), StoreError> {
        let encoded = encode_directory(groups)?;
        self.values
            .write()
            .await
            .insert(GROUP_LIST_KEY.to_string(), encoded);
        Ok(())
    }

    async fn max_capacity(&self, group_name: &str) -> Result<Option<u32>, StoreError> {
        let key = max_capacity_key(group_name);
        let values = self.values.read().await;
        parse_capacity(&key, values.get(&key).map(String::as_str))
    }

    async fn set_max_capacity(&self, group_name: &str, capacity: u32) -> Result<(), StoreError> {
        self.values
            .write()
            .await
            .insert(max_capacity_key(group_name), capacity.to_string());
        Ok(())
    }

    async fn client_handle(&self, client_id: &str) -> Result<Option<ChannelHandle>, StoreError> {
        Ok(self
            .values
            .read()
            .await
            .get(client_id)
            .map(|handle| ChannelHandle::new(handle.clone())))
    }

    async fn set_client_handle(
        &self,
        client_id: &str,
        handle: &ChannelHandle,
    ) -> Result<(), StoreError> {
        self.values
            .write()
            .await
            .insert(client_id.to_string(), handle.to_string());
        Ok(())
    }

    async fn remove_client_handle(&self, client_id: &str) -> Result<(), StoreError> {
        self.values.write().await.remove(client_id);
        Ok(())
    }

    async fn add_member(&self, group_name: &str, handle: &ChannelHandle) -> Result<(), StoreError> {
        self.sets
            .write()
            .await
            .entry(members_key(group_name))
            .or_default()
            .insert(handle.clone());
        Ok(())
    }

    async fn remove_member(
        &self,
        group_name: &str,
        handle: &ChannelHandle,
    ) -> Result<(), StoreError> {
        let key = members_key(group_name);
        let mut sets = self.sets.write().await;
        if let Some(members) = sets.get_mut(&key) {
            members.remove(handle);
            if members.is_empty() {
                sets.remove(&key);
            }
        }
        Ok(())
    }

    async fn members(&self, group_name: &str) -> Result<BTreeSet<ChannelHandle>, StoreError> {
        Ok(self
            .sets
            .read()
            .await
            .get(&members_key(group_name))
            .cloned()
            .unwrap_or_default())
    }
}
