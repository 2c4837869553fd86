//! Redis binding of the shared store.
//!
//! One multiplexed tokio connection per process, cloned per call.

use std::collections::BTreeSet;

use async_trait::async_trait;
use huddle_core::ChannelHandle;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use super::{
    decode_directory, encode_directory, max_capacity_key, members_key, parse_capacity,
    GroupDirectory, SharedGroupStore, StoreError, GROUP_LIST_KEY,
};

#[derive(Clone)]
pub struct RedisStore {
    connection: MultiplexedConnection,
}

impl RedisStore {
    /// Connect to `url` (`redis://host:port[/db]`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_tokio_connection().await?;
        log::info!("Connected to shared store at {url}");
        Ok(Self { connection })
    }

    pub fn url_for(host: &str, port: u16) -> String {
        format!("redis://{host}:{port}")
    }
}

#[async_trait]
impl SharedGroupStore for RedisStore {
    async fn group_list(&self) -> Result<GroupDirectory, StoreError> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn.get(GROUP_LIST_KEY).await?;
        decode_directory(raw.as_deref())
    }

    async fn set_group_list(&self, groups: &GroupDirectory) -> Result<(), StoreError> {
        let encoded = encode_directory(groups)?;
        let mut conn = self.connection.clone();
        conn.set::<_, _, ()>(GROUP_LIST_KEY, encoded).await?;
        Ok(())
    }

    async fn max_capacity(&self, group_name: &str) -> Result<Option<u32>, StoreError> {
        let key = max_capacity_key(group_name);
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn.get(&key).await?;
        parse_capacity(&key, raw.as_deref())
    }

    async fn set_max_capacity(&self, group_name: &str, capacity: u32) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        conn.set::<_, _, ()>(max_capacity_key(group_name), capacity.to_string())
            .await?;
        Ok(())
    }

    async fn client_handle(&self, client_id: &str) -> Result<Option<ChannelHandle>, StoreError> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn.get(client_id).await?;
        Ok(raw.map(ChannelHandle::new))
    }

    async fn set_client_handle(
        &self,
        client_id: &str,
        handle: &ChannelHandle,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        conn.set::<_, _, ()>(client_id, handle.as_str()).await?;
        Ok(())
    }

    async fn remove_client_handle(&self, client_id: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        conn.del::<_, ()>(client_id).await?;
        Ok(())
    }

    async fn add_member(&self, group_name: &str, handle: &ChannelHandle) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        conn.sadd::<_, _, ()>(members_key(group_name), handle.as_str())
            .await?;
        Ok(())
    }

    async fn remove_member(
        &self,
        group_name: &str,
        handle: &ChannelHandle,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        conn.srem::<_, _, ()>(members_key(group_name), handle.as_str())
            .await?;
        Ok(())
    }

    async fn members(&self, group_name: &str) -> Result<BTreeSet<ChannelHandle>, StoreError> {
        let mut conn = self.connection.clone();
        let raw: Vec<String> = conn.smembers(members_key(group_name)).await?;
        Ok(raw.into_iter().map(ChannelHandle::new).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_for() {
        assert_eq!(RedisStore::url_for("localhost", 7379), "redis://localhost:7379");
    }

    #[tokio::test]
    async fn test_connect_rejects_malformed_url() {
        assert!(RedisStore::connect("not a url").await.is_err());
    }
}
