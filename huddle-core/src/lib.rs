//! # huddle-core: shared protocol types for huddle
//!
//! Group admission and presence routing between `huddle-server` processes and
//! `huddle-client` sessions.
//!
//! ```text
//! ┌───────────────┐   ClientFrame (bincode)   ┌────────────────┐
//! │ ClientSession │ ────────────────────────► │ GroupServer    │
//! │ (per client)  │ ◄──────────────────────── │ (per process)  │
//! └───────────────┘   ServerFrame (bincode)   └───────┬────────┘
//!                                                     │
//!                                            ┌────────┴─────────┐
//!                                            │ SharedGroupStore │
//!                                            │ (Redis)          │
//!                                            └──────────────────┘
//! ```

pub mod protocol;

pub use protocol::{
    ChannelHandle, ClientFrame, CreateGroupResponse, GroupInfo, JoinDecision,
    ListGroupsResponse, Message, ProtocolError, Reply, Request, ServerEvent, ServerFrame,
    STATUS_CONFLICT, STATUS_OK,
};
