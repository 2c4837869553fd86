//! # huddle-server: group admission and presence routing
//!
//! Stateless WebSocket processes that agree on groups, capacities and client
//! routing through a shared key-value store.
//!
//! ```text
//! ┌─────────────┐  ws   ┌──────────────────────────────┐
//! │ client      │ ◄───► │ GroupServer                  │
//! └─────────────┘       │  ├─ GroupAdmissionController │
//!                       │  ├─ ChannelHub (rooms)       │
//!                       │  └─ PresenceRouter           │
//!                       └──────────────┬───────────────┘
//!                                      │
//!                             ┌────────┴─────────┐
//!                             │ SharedGroupStore │
//!                             └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`store`]: `GroupList`, `MaxCapacity#<group>`, client routing, member sets
//! - [`transport`]: in-process channel registry with room multicast
//! - [`presence`]: live member counts (transport table or store sets)
//! - [`admission`]: list/create/delete/join/leave/message rules
//! - [`server`]: WebSocket accept loop and per-connection pump
//! - [`config`]: `ServerConfig` and environment parsing

pub mod admission;
pub mod config;
pub mod error;
pub mod presence;
pub mod server;
pub mod store;
pub mod transport;

pub use admission::{AdmissionPolicy, GroupAdmissionController, Session};
pub use config::{PresenceSource, ServerConfig, StoreBackend};
pub use error::ServerError;
pub use presence::{PresenceRouter, StorePresence, TransportPresence};
pub use server::{GroupServer, ServerStats};
pub use store::{MemoryStore, RedisStore, SharedGroupStore, StoreError};
pub use transport::{ChannelHub, HubStats, Room, TransportChannel};
