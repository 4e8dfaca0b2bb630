//! Connection lifecycle hooks.
//!
//! An [`EventHandler`] sees every connection arrive, every application frame
//! it sends and its departure. All three hooks have defaults: connects and
//! disconnects are ignored, and messages go through the hub's built-in
//! envelope protocol ([`Hub::dispatch`]).
//!
//! # Examples
//!
//! ```
//! use async_trait::async_trait;
//! use wshub_core::prelude::*;
//!
//! struct Lobby;
//!
//! #[async_trait]
//! impl EventHandler for Lobby {
//!     fn on_connect(&self, hub: &Hub, conn: &Connection) {
//!         let _ = hub.join("lobby", conn.id());
//!     }
//! }
//!
//! let hub = Hub::builder().handler(Lobby).build().unwrap();
//! # drop(hub);
//! ```

use crate::connection::Connection;
use crate::error::Result;
use crate::hub::Hub;
use crate::message::Message;
use async_trait::async_trait;

/// Application callbacks for connection events.
///
/// `on_connect` and `on_disconnect` run synchronously on the task that
/// registered or removed the connection; keep them short and non-blocking.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Called once the connection is registered and supervised.
    fn on_connect(&self, hub: &Hub, conn: &Connection) {
        let _ = (hub, conn);
    }

    /// Called for every text or binary frame that is not a heartbeat reply.
    ///
    /// An error is logged by the session and does not close the connection.
    async fn on_message(&self, hub: &Hub, conn: &Connection, message: Message) -> Result<()> {
        hub.dispatch(conn, message).await
    }

    /// Called once after the connection has left the registry.
    fn on_disconnect(&self, hub: &Hub, conn: &Connection) {
        let _ = (hub, conn);
    }
}

/// Uses every default: envelope dispatch, no connect or disconnect hooks.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHandler;

impl EventHandler for DefaultHandler {}
