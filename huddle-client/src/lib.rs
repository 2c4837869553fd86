//! # huddle-client: group sessions over pluggable transports
//!
//! ```text
//! ┌───────────────┐     TransportAdapter     ┌──────────────────────────┐
//! │ ClientSession │ ───────────────────────► │ NativeTransport (ws)     │
//! │ (per client)  │                          ├──────────────────────────┤
//! └───────────────┘                          │ BridgeTransport          │
//!                                            │  └─ EmbeddedAdapter      │
//!                                            │      └─ NativeTransport  │
//!                                            └──────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`session`]: join/leave state machine, cancellation and disposal
//! - [`adapter`]: the transport contract
//! - [`native`]: WebSocket binding with ack-correlated requests
//! - [`bridge`]: string-payload binding for embedded runtimes
//! - [`config`]: `ClientConfig` and `JoiningConfig`

pub mod adapter;
pub mod bridge;
pub mod config;
pub mod error;
pub mod native;
pub mod session;

pub use adapter::{ChannelEvent, EventReceiver, TransportAdapter};
pub use bridge::{BridgeRouter, BridgeTransport, EmbeddedAdapter, EmbeddedRuntime, LoopbackRuntime};
pub use config::{ClientConfig, JoiningConfig};
pub use error::ClientError;
pub use native::NativeTransport;
pub use session::{ClientSession, SessionEvent, SessionState};
