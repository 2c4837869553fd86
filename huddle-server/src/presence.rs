//! Who is in which group.
//!
//! Two derivations, interchangeable from the admission controller's point of
//! view:
//!
//! - [`TransportPresence`] reads the transport's own multicast table. Nothing
//!   is recorded separately.
//! - [`StorePresence`] records each join/leave as a member set in the shared
//!   store, so every process sees the same count.
//!
//! Both guarantee that right after a successful join the count includes the
//! new member and right after leave/disconnect cleanup it excludes it.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use huddle_core::ChannelHandle;

use crate::store::{SharedGroupStore, StoreError};
use crate::transport::TransportChannel;

#[async_trait]
pub trait PresenceRouter: Send + Sync {
    async fn members(&self, group_name: &str) -> Result<BTreeSet<ChannelHandle>, StoreError>;

    async fn member_count(&self, group_name: &str) -> Result<usize, StoreError> {
        Ok(self.members(group_name).await?.len())
    }

    async fn record_join(&self, group_name: &str, handle: &ChannelHandle)
        -> Result<(), StoreError>;

    async fn record_leave(&self, group_name: &str, handle: &ChannelHandle)
        -> Result<(), StoreError>;
}

/// Membership straight from the transport's room table.
pub struct TransportPresence {
    transport: Arc<dyn TransportChannel>,
}

impl TransportPresence {
    pub fn new(transport: Arc<dyn TransportChannel>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl PresenceRouter for TransportPresence {
    async fn members(&self, group_name: &str) -> Result<BTreeSet<ChannelHandle>, StoreError> {
        Ok(self.transport.room_members(group_name).await)
    }

    async fn record_join(&self, _group_name: &str, _handle: &ChannelHandle) -> Result<(), StoreError> {
        Ok(())
    }

    async fn record_leave(&self, _group_name: &str, _handle: &ChannelHandle) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Membership recorded explicitly in the shared store.
pub struct StorePresence {
    store: Arc<dyn SharedGroupStore>,
}

impl StorePresence {
    pub fn new(store: Arc<dyn SharedGroupStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl PresenceRouter for StorePresence {
    async fn members(&self, group_name: &str) -> Result<BTreeSet<ChannelHandle>, StoreError> {
        self.store.members(group_name).await
    }

    async fn record_join(&self, group_name: &str, handle: &ChannelHandle) -> Result<(), StoreError> {
        self.store.add_member(group_name, handle).await
    }

    async fn record_leave(&self, group_name: &str, handle: &ChannelHandle) -> Result<(), StoreError> {
        self.store.remove_member(group_name, handle).await
    }
}
