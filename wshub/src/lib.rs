//! # WsHub
//!
//! Real-time WebSocket hub: connections, rooms, presence, heartbeat
//! supervision and RPC over JSON envelopes.
//!
//! This crate re-exports [`wshub_core`]. See its documentation for the
//! component breakdown.
//!
//! ```no_run
//! use wshub::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     Server::new(Hub::new()).listen("127.0.0.1:9000").await
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub use wshub_core::*;

/// Commonly used types, for glob import.
pub mod prelude {
    pub use wshub_core::prelude::*;
}
