//! Group admission controller.
//!
//! One controller per process, shared by every connection. Each connection
//! owns a [`Session`] (its channel handle, client id and current group) and
//! hands every decoded [`Request`] to [`GroupAdmissionController::dispatch`].
//!
//! Join flow:
//! ```text
//! join(clientId, group, cap?)
//!   │  (per-group admission lock when strict)
//!   ├─ cap supplied and no record?  → persist MaxCapacity#group
//!   ├─ record present and count ≥ cap → "rejected", nothing changes
//!   └─ otherwise
//!        clientId → handle   (store)
//!        record presence     (presence router)
//!        add to GroupList if new
//!        join multicast room (transport)
//!        "member joined" → rest of the group
//!        → "approved"
//! ```
//!
//! Across processes the capacity check is still read-then-act on the shared
//! store, so two processes admitting at the same instant can over-admit.

use std::collections::HashMap;
use std::sync::Arc;

use huddle_core::{
    ChannelHandle, CreateGroupResponse, GroupInfo, JoinDecision, ListGroupsResponse, Message,
    Reply, Request, ServerEvent, STATUS_OK,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::presence::PresenceRouter;
use crate::store::{is_reserved_key, SharedGroupStore, StoreError};
use crate::transport::TransportChannel;

/// Per-connection protocol state.
#[derive(Debug, Clone)]
pub struct Session {
    handle: ChannelHandle,
    client_id: String,
    group: Option<String>,
}

impl Session {
    pub fn new(handle: ChannelHandle) -> Self {
        Self {
            handle,
            client_id: String::new(),
            group: None,
        }
    }

    pub fn handle(&self) -> &ChannelHandle {
        &self.handle
    }

    /// Client id bound by the last approved join (empty before that).
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }
}

/// Controller policy knobs.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionPolicy {
    pub strict_admission: bool,
    pub prune_empty_groups: bool,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            strict_admission: true,
            prune_empty_groups: true,
        }
    }
}

pub struct GroupAdmissionController {
    store: Arc<dyn SharedGroupStore>,
    transport: Arc<dyn TransportChannel>,
    presence: Arc<dyn PresenceRouter>,
    policy: AdmissionPolicy,
    /// Group name → lock serializing check-then-join in this process
    admission_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl GroupAdmissionController {
    pub fn new(
        store: Arc<dyn SharedGroupStore>,
        transport: Arc<dyn TransportChannel>,
        presence: Arc<dyn PresenceRouter>,
        policy: AdmissionPolicy,
    ) -> Self {
        Self {
            store,
            transport,
            presence,
            policy,
            admission_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> AdmissionPolicy {
        self.policy
    }

    /// Route one request. `Ok(None)` for fire-and-forget requests.
    pub async fn dispatch(
        &self,
        session: &mut Session,
        request: Request,
    ) -> Result<Option<Reply>, StoreError> {
        log::debug!("{} from channel {}", request.event_name(), session.handle);
        match request {
            Request::ListGroups => Ok(Some(Reply::Groups(self.list_groups().await?))),
            Request::CreateGroup {
                group_name,
                max_capacity,
            } => Ok(Some(Reply::Created(
                self.create_group(session, &group_name, max_capacity).await?,
            ))),
            Request::DeleteGroup { group_name } => {
                Ok(Some(Reply::Status(self.delete_group(session, &group_name).await)))
            }
            Request::Join {
                client_id,
                group_name,
                max_capacity,
            } => Ok(Some(Reply::Join(
                self.join(session, &client_id, &group_name, max_capacity).await?,
            ))),
            Request::Leave => {
                self.leave(session).await?;
                Ok(None)
            }
            Request::Message(message) => {
                self.send_message(session, message).await?;
                Ok(None)
            }
        }
    }

    pub async fn list_groups(&self) -> Result<ListGroupsResponse, StoreError> {
        let groups = self
            .store
            .group_list()
            .await?
            .into_iter()
            .map(|(name, id)| GroupInfo { id, name })
            .collect();
        Ok(ListGroupsResponse { groups })
    }

    pub async fn create_group(
        &self,
        session: &Session,
        group_name: &str,
        max_capacity: u32,
    ) -> Result<CreateGroupResponse, StoreError> {
        let mut groups = self.store.group_list().await?;
        if groups.contains_key(group_name) {
            let response = CreateGroupResponse::conflict(group_name);
            log::info!("{}", response.message);
            return Ok(response);
        }
        groups.insert(group_name.to_string(), session.handle.to_string());
        self.store.set_group_list(&groups).await?;

        if max_capacity > 0 {
            self.raise_capacity(group_name, max_capacity).await?;
        }

        let response = CreateGroupResponse::created(group_name);
        log::info!("{}", response.message);
        Ok(response)
    }

    /// Tell every other member of `group_name` the group is gone. Members leave
    /// on their own, which prunes the directory entry.
    pub async fn delete_group(&self, session: &Session, group_name: &str) -> u16 {
        let notified = self
            .transport
            .broadcast(group_name, Some(&session.handle), &ServerEvent::GroupDeleted)
            .await;
        log::info!(
            "Group {group_name} deleted by channel {} ({notified} members notified)",
            session.handle
        );
        STATUS_OK
    }

    pub async fn join(
        &self,
        session: &mut Session,
        client_id: &str,
        group_name: &str,
        max_capacity: Option<u32>,
    ) -> Result<JoinDecision, StoreError> {
        let client_id = if client_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            client_id.to_string()
        };
        if is_reserved_key(&client_id) {
            log::warn!("Reject client: {client_id} collides with a reserved store key");
            return Ok(JoinDecision::Rejected);
        }

        if session.group.as_deref() == Some(group_name) {
            if session.client_id != client_id {
                log::info!("Rebinding {} to {client_id} in {group_name}", session.client_id);
                self.bind_client(session, &client_id).await?;
            }
            return Ok(JoinDecision::Approved);
        }

        let _guard = self.admission_guard(group_name).await;

        if let Some(capacity) = max_capacity.filter(|c| *c > 0) {
            if self.store.max_capacity(group_name).await?.is_none() {
                self.store.set_max_capacity(group_name, capacity).await?;
            }
        }

        if let Some(capacity) = self.store.max_capacity(group_name).await? {
            let connected = self.presence.member_count(group_name).await?;
            if connected >= capacity as usize {
                log::info!("Reject client: {client_id} ({group_name} is {connected}/{capacity})");
                return Ok(JoinDecision::Rejected);
            }
        }

        if session.group.is_some() {
            if let Some(previous) = self.leave_group(session).await? {
                self.prune_directory(&[previous]).await?;
            }
        }

        // Store writes first: the room and the announcement only happen once
        // nothing else can fail.
        let mut groups = self.store.group_list().await?;
        self.bind_client(session, &client_id).await?;
        self.presence.record_join(group_name, &session.handle).await?;
        if !groups.contains_key(group_name) {
            groups.insert(group_name.to_string(), session.handle.to_string());
            if let Err(e) = self.store.set_group_list(&groups).await {
                if let Err(undo) = self.presence.record_leave(group_name, &session.handle).await {
                    log::error!("Failed to undo presence of {client_id} in {group_name}: {undo}");
                }
                return Err(e);
            }
        }

        self.transport.join(&session.handle, group_name).await;
        self.transport
            .broadcast(
                group_name,
                Some(&session.handle),
                &ServerEvent::MemberJoined(client_id.clone()),
            )
            .await;

        log::info!("join: clientId={client_id}, groupName={group_name}");
        session.group = Some(group_name.to_string());
        Ok(JoinDecision::Approved)
    }

    pub async fn send_message(
        &self,
        session: &Session,
        mut message: Message,
    ) -> Result<(), StoreError> {
        message.from = session.client_id.clone();

        if let Some(to) = message.target() {
            match self.store.client_handle(to).await? {
                Some(handle) => {
                    if !self.transport.send_to(&handle, &ServerEvent::Message(message.clone())).await {
                        log::debug!("Direct message to {to} not delivered: channel {handle} is not here");
                    }
                }
                None => log::debug!("Direct message to {to} dropped: no channel mapping"),
            }
            return Ok(());
        }

        match &session.group {
            Some(group_name) => {
                self.transport
                    .broadcast(group_name, Some(&session.handle), &ServerEvent::Message(message))
                    .await;
            }
            None => log::debug!("Message from channel {} dropped: not in a group", session.handle),
        }
        Ok(())
    }

    /// Voluntary leave.
    pub async fn leave(&self, session: &mut Session) -> Result<(), StoreError> {
        if let Some(group_name) = self.leave_group(session).await? {
            self.prune_directory(&[group_name]).await?;
        }
        Ok(())
    }

    /// Connection closed: leave, forget the routing entry, and prune groups this
    /// channel was representing.
    pub async fn disconnect(&self, session: &mut Session) -> Result<(), StoreError> {
        let mut candidates: Vec<String> = self.leave_group(session).await?.into_iter().collect();

        self.release_client(session).await?;

        let represented = self
            .store
            .group_list()
            .await?
            .into_iter()
            .filter(|(_, id)| id == session.handle.as_str())
            .map(|(name, _)| name);
        candidates.extend(represented);

        self.prune_directory(&candidates).await
    }

    /// Point `client_id` at this channel and give up the id it held before.
    async fn bind_client(&self, session: &mut Session, client_id: &str) -> Result<(), StoreError> {
        self.store.set_client_handle(client_id, &session.handle).await?;
        if session.client_id != client_id {
            self.release_client(session).await?;
            session.client_id = client_id.to_string();
        }
        Ok(())
    }

    /// Remove this session's routing entry unless another channel took it over.
    async fn release_client(&self, session: &Session) -> Result<(), StoreError> {
        if session.client_id.is_empty() {
            return Ok(());
        }
        let mapped = self.store.client_handle(&session.client_id).await?;
        if mapped.as_ref() == Some(&session.handle) {
            self.store.remove_client_handle(&session.client_id).await?;
        }
        Ok(())
    }

    async fn leave_group(&self, session: &mut Session) -> Result<Option<String>, StoreError> {
        let Some(group_name) = session.group.take() else {
            return Ok(None);
        };
        log::info!(
            "client leaving: clientId={}, groupName={group_name}",
            session.client_id
        );
        self.transport
            .broadcast(
                &group_name,
                Some(&session.handle),
                &ServerEvent::MemberLeaving(session.client_id.clone()),
            )
            .await;
        self.transport.leave(&session.handle, &group_name).await;
        self.presence.record_leave(&group_name, &session.handle).await?;
        Ok(Some(group_name))
    }

    /// Drop directory entries among `candidates` that have no live members.
    async fn prune_directory(&self, candidates: &[String]) -> Result<(), StoreError> {
        if !self.policy.prune_empty_groups || candidates.is_empty() {
            return Ok(());
        }

        let mut groups = self.store.group_list().await?;
        let mut pruned = Vec::new();
        for group_name in candidates {
            if !groups.contains_key(group_name) {
                continue;
            }
            let count = self.presence.member_count(group_name).await?;
            log::debug!("group: {group_name} group size: {count}");
            if count == 0 {
                groups.remove(group_name);
                pruned.push(group_name.as_str());
            }
        }

        if !pruned.is_empty() {
            self.store.set_group_list(&groups).await?;
            let mut locks = self.admission_locks.lock().await;
            for group_name in &pruned {
                if locks.get(*group_name).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                    locks.remove(*group_name);
                }
            }
            log::info!("Pruned empty groups: {pruned:?}");
        }
        Ok(())
    }

    /// Capacity records only ever grow.
    async fn raise_capacity(&self, group_name: &str, capacity: u32) -> Result<(), StoreError> {
        match self.store.max_capacity(group_name).await? {
            Some(current) if current >= capacity => Ok(()),
            _ => self.store.set_max_capacity(group_name, capacity).await,
        }
    }

    async fn admission_guard(&self, group_name: &str) -> Option<OwnedMutexGuard<()>> {
        if !self.policy.strict_admission {
            return None;
        }
        let lock = self
            .admission_locks
            .lock()
            .await
            .entry(group_name.to_string())
            .or_default()
            .clone();
        Some(lock.lock_owned().await)
    }
}
