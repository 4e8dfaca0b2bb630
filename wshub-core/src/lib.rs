//! # WsHub Core - Real-Time WebSocket Hub
//!
//! `wshub-core` is the engine behind WsHub: it tracks live WebSocket
//! connections, groups them into rooms, fans messages out with a strict
//! drop-the-slow-consumer policy, keeps per-user presence and supervises
//! liveness with pings and timeouts.
//!
//! ## Overview
//!
//! One [`Hub`] per server instance composes five parts:
//!
//! - [`registry`]: connections and room membership behind one lock
//! - [`broadcast`]: fan-out to everyone, a room, a user or one connection
//! - [`presence`]: last-known status, last-seen time and metadata per user
//! - [`heartbeat`]: ping sender and timeout reaper
//! - [`rpc`]: named request/response methods callable over the socket
//!
//! The transport glue lives in [`session`] (per-socket read and drain loops)
//! and [`server`] (TCP accept and handshake).
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐   frames   ┌────────────┐
//! │  read loop    │──────────→ │    Hub     │──→ EventHandler
//! └───────────────┘            │            │
//! ┌───────────────┐  try_send  │  Registry  │
//! │  drain loop   │←────────── │  Router    │
//! └───────────────┘   queue    │  Presence  │
//!                              │  Heartbeat │──→ reap → Registry::remove
//!                              └────────────┘
//! ```
//!
//! Every producer enqueues without waiting. A connection whose bounded queue
//! is full is removed on the spot; the rest of the fan-out continues.
//!
//! ## Quick Start
//!
//! ```no_run
//! use wshub_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let hub = Hub::new();
//!     hub.register_rpc("echo", |params| async move { Ok(params) });
//!
//!     Server::new(hub).listen("127.0.0.1:9000").await
//! }
//! ```
//!
//! Clients speak JSON envelopes:
//!
//! ```text
//! {"type": "join_room", "room": "general"}
//! {"type": "room_message", "room": "general", "data": {"text": "hi"}}
//! {"type": "rpc", "id": "1", "data": {"method": "echo", "params": [1, 2]}}
//! ```
//!
//! ## Custom Lifecycle Hooks
//!
//! ```
//! use async_trait::async_trait;
//! use wshub_core::prelude::*;
//!
//! struct Greeter;
//!
//! #[async_trait]
//! impl EventHandler for Greeter {
//!     fn on_connect(&self, hub: &Hub, conn: &Connection) {
//!         let welcome = format!("welcome, {}", conn.user_id());
//!         let _ = hub.send_to(conn.id(), Message::text(welcome));
//!     }
//! }
//!
//! let hub = Hub::builder().handler(Greeter).build().unwrap();
//! # drop(hub);
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod broadcast;
pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod heartbeat;
pub mod hub;
pub mod message;
pub mod presence;
pub mod registry;
pub mod rpc;
pub mod server;
pub mod session;

pub use broadcast::Broadcaster;
pub use config::{HeartbeatConfig, HubConfig, PresenceConfig};
pub use connection::{Connection, ConnectionId, ConnectionInfo};
pub use envelope::Envelope;
pub use error::{Error, Result};
pub use handler::{DefaultHandler, EventHandler};
pub use heartbeat::{HeartbeatStats, HeartbeatSupervisor};
pub use hub::{Hub, HubBuilder};
pub use message::{Message, MessageType};
pub use presence::{PresenceInfo, PresenceStatus, PresenceTracker};
pub use registry::Registry;
pub use rpc::{RpcHandler, RpcRequest, RpcResponse, RpcTable};
pub use server::Server;
pub use session::serve_connection;

/// Commonly used types, for glob import.
///
/// ```
/// use wshub_core::prelude::*;
///
/// let hub = Hub::new();
/// assert_eq!(hub.connection_count(), 0);
/// ```
pub mod prelude {
    pub use crate::config::{HeartbeatConfig, HubConfig, PresenceConfig};
    pub use crate::connection::{Connection, ConnectionId};
    pub use crate::envelope::{Envelope, kinds};
    pub use crate::error::{Error, Result};
    pub use crate::handler::EventHandler;
    pub use crate::hub::Hub;
    pub use crate::message::{Message, MessageType};
    pub use crate::presence::PresenceStatus;
    pub use crate::server::Server;
}
