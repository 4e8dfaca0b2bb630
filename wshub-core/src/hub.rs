//! The hub: one per server instance.
//!
//! [`Hub`] composes the [`Registry`], the [`Broadcaster`], the
//! [`PresenceTracker`], the [`HeartbeatSupervisor`] and the [`RpcTable`] and
//! wires them together:
//!
//! - every connection added is registered with the heartbeat supervisor and
//!   marks its user `online`
//! - every removal, whatever triggered it (read error, full queue, heartbeat
//!   timeout, explicit call), unregisters the heartbeat entry, marks the user
//!   `offline` once their last connection is gone and calls
//!   [`EventHandler::on_disconnect`] exactly once
//! - the heartbeat timeout callback removes the connection from the registry
//! - every inbound frame refreshes the sender's last-seen time
//!
//! The online and offline decisions are presence transitions, so a device
//! connecting while another one disconnects cannot leave a connected user
//! marked `offline`.
//!
//! `Hub` is a cheap handle; clones share the same state.
//!
//! # Examples
//!
//! ```
//! use wshub_core::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> wshub_core::Result<()> {
//! let hub = Hub::new();
//! let (alice, mut outbound) = hub.open_connection(Some("alice".into()));
//! hub.add_connection(alice.clone());
//!
//! hub.join("general", alice.id())?;
//! hub.broadcast_to_room("general", Message::text("hello"))?;
//!
//! assert_eq!(hub.room_members("general"), vec!["alice".to_string()]);
//! assert_eq!(hub.get_presence("alice"), PresenceStatus::Online);
//! # let _ = outbound.try_recv();
//! # Ok(())
//! # }
//! ```

use crate::broadcast::Broadcaster;
use crate::config::HubConfig;
use crate::connection::{Connection, ConnectionId};
use crate::envelope::{Envelope, kinds};
use crate::error::{Error, Result};
use crate::handler::{DefaultHandler, EventHandler};
use crate::heartbeat::HeartbeatSupervisor;
use crate::message::Message;
use crate::presence::{PresenceInfo, PresenceStatus, PresenceTracker};
use crate::registry::Registry;
use crate::rpc::{RpcRequest, RpcResponse, RpcTable};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

struct HubInner {
    config: HubConfig,
    registry: Arc<Registry>,
    broadcaster: Broadcaster,
    presence: Arc<PresenceTracker>,
    heartbeat: Arc<HeartbeatSupervisor>,
    rpc: RpcTable,
    handler: Arc<dyn EventHandler>,
    next_id: AtomicU64,
}

impl Drop for HubInner {
    fn drop(&mut self) {
        self.heartbeat.stop();
        self.presence.stop_cleanup();
    }
}

/// Real-time message hub.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

/// Builder for [`Hub`].
#[derive(Default)]
pub struct HubBuilder {
    config: HubConfig,
    handler: Option<Arc<dyn EventHandler>>,
}

impl HubBuilder {
    /// Sets the configuration.
    pub fn config(mut self, config: HubConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the lifecycle handler. Defaults to [`DefaultHandler`].
    pub fn handler<H: EventHandler>(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Validates the configuration and builds the hub.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if the configuration is inconsistent.
    pub fn build(self) -> Result<Hub> {
        self.config.validate()?;
        let handler = self.handler.unwrap_or_else(|| Arc::new(DefaultHandler));
        Ok(Hub::assemble(self.config, handler))
    }
}

impl Hub {
    /// Creates a hub with the default configuration and handler.
    pub fn new() -> Self {
        Self::assemble(HubConfig::default(), Arc::new(DefaultHandler))
    }

    /// Creates a hub builder.
    pub fn builder() -> HubBuilder {
        HubBuilder::default()
    }

    /// Creates a hub with `config` and the default handler.
    pub fn with_config(config: HubConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    fn assemble(config: HubConfig, handler: Arc<dyn EventHandler>) -> Self {
        let registry = Arc::new(Registry::new());
        let broadcaster = Broadcaster::new(registry.clone());
        let presence = Arc::new(PresenceTracker::new(broadcaster.clone()));
        let heartbeat = Arc::new(HeartbeatSupervisor::new(
            config.heartbeat.clone(),
            registry.clone(),
        ));

        let inner = Arc::new(HubInner {
            config,
            registry,
            broadcaster,
            presence,
            heartbeat,
            rpc: RpcTable::new(),
            handler,
            next_id: AtomicU64::new(0),
        });

        let weak = Arc::downgrade(&inner);
        inner.registry.set_removal_hook(Arc::new(move |conn: &Connection| {
            if let Some(inner) = weak.upgrade() {
                Hub { inner }.on_removed(conn);
            }
        }));

        Self { inner }
    }

    fn weak(&self) -> Weak<HubInner> {
        Arc::downgrade(&self.inner)
    }

    fn on_removed(&self, conn: &Connection) {
        self.inner.heartbeat.unregister_connection(conn.id());

        let user_id = conn.user_id();
        let registry = &self.inner.registry;
        self.inner.presence.transition(user_id, |current| {
            let last = registry.connections_for_user(user_id).is_empty();
            (last && current != PresenceStatus::Offline).then_some(PresenceStatus::Offline)
        });

        debug!(
            "Connection {} ({}) removed, {} remaining",
            conn.id(),
            user_id,
            self.inner.registry.count()
        );
        self.inner.handler.on_disconnect(self, conn);
    }

    /// Returns the active configuration.
    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    /// Returns the connection and room registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    /// Returns the broadcast router.
    pub fn broadcaster(&self) -> &Broadcaster {
        &self.inner.broadcaster
    }

    /// Returns the presence tracker.
    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.inner.presence
    }

    /// Returns the heartbeat supervisor.
    pub fn heartbeat(&self) -> &Arc<HeartbeatSupervisor> {
        &self.inner.heartbeat
    }

    /// Returns the RPC method table.
    pub fn rpc(&self) -> &RpcTable {
        &self.inner.rpc
    }

    /// Allocates a fresh connection id of the form `conn_<n>`.
    pub fn next_connection_id(&self) -> ConnectionId {
        let n = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        format!("conn_{}", n)
    }

    /// Creates an unregistered connection with a fresh id and an outbound
    /// queue of the configured capacity. Without a `user_id`, the connection
    /// id doubles as the user id.
    pub fn open_connection(&self, user_id: Option<String>) -> (Connection, mpsc::Receiver<Message>) {
        let id = self.next_connection_id();
        let user_id = user_id.unwrap_or_else(|| id.clone());
        Connection::channel(id, user_id, self.inner.config.outbound_capacity)
    }

    // ---- script-host bindings ----

    /// Registers `conn`, starts supervising it and runs
    /// [`EventHandler::on_connect`]. Returns the number of connections.
    pub fn add_connection(&self, conn: Connection) -> usize {
        let count = self.inner.registry.add(conn.clone());
        self.inner.heartbeat.register_connection(conn.id());

        self.mark_online(&conn);

        debug!("Connection {} ({}) added, total: {}", conn.id(), conn.user_id(), count);
        self.inner.handler.on_connect(self, &conn);
        count
    }

    /// Removes a connection. Returns `false` if it was not registered.
    pub fn remove_connection(&self, id: &str) -> bool {
        self.inner.registry.remove(id).is_some()
    }

    /// Removes `conn` only if the registry still holds this very handle, not
    /// a newer connection registered under the same id.
    pub fn disconnect(&self, conn: &Connection) -> bool {
        self.inner.registry.remove_handle(conn).is_some()
    }

    fn mark_online(&self, conn: &Connection) {
        let registry = &self.inner.registry;
        self.inner.presence.transition(conn.user_id(), |current| {
            (current == PresenceStatus::Offline && registry.contains(conn.id()))
                .then_some(PresenceStatus::Online)
        });
    }

    fn refresh_presence(&self, conn: &Connection) {
        let presence = &self.inner.presence;
        let user_id = conn.user_id();
        if !presence.touch(user_id) || presence.get_presence(user_id) == PresenceStatus::Offline {
            self.mark_online(conn);
        }
    }

    /// Queues `message` for every connection.
    pub fn broadcast(&self, message: Message) -> usize {
        self.inner.broadcaster.broadcast(message)
    }

    /// Queues `message` for every connection except `exclude_id`.
    pub fn broadcast_except(&self, message: Message, exclude_id: &str) -> usize {
        self.inner.broadcaster.broadcast_except(message, exclude_id)
    }

    /// Queues `message` for every member of `room`.
    pub fn broadcast_to_room(&self, room: &str, message: Message) -> Result<usize> {
        self.inner.broadcaster.broadcast_to_room(room, message)
    }

    /// Queues `message` for every connection of `user_id`.
    pub fn send_to_user(&self, user_id: &str, message: Message) -> Result<usize> {
        self.inner.broadcaster.send_to_user(user_id, message)
    }

    /// Queues `message` for one connection.
    pub fn send_to(&self, id: &str, message: Message) -> Result<()> {
        self.inner.broadcaster.send_to(id, message)
    }

    /// Adds connection `id` to `room`.
    pub fn join(&self, room: &str, id: &str) -> Result<()> {
        self.inner.registry.join(room, id)
    }

    /// Removes connection `id` from `room`.
    pub fn leave(&self, room: &str, id: &str) -> Result<()> {
        self.inner.registry.leave(room, id)
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.inner.registry.count()
    }

    /// Number of non-empty rooms.
    pub fn room_count(&self) -> usize {
        self.inner.registry.room_count()
    }

    /// User ids of the members of `room`, sorted, one entry per connection.
    /// Empty if the room does not exist.
    pub fn room_members(&self, room: &str) -> Vec<String> {
        let mut users: Vec<String> = self
            .inner
            .registry
            .room_members(room)
            .iter()
            .map(|c| c.user_id().to_string())
            .collect();
        users.sort();
        users
    }

    /// Distinct user ids with at least one live connection, sorted.
    pub fn online_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self
            .inner
            .registry
            .all_connections()
            .iter()
            .map(|c| c.user_id().to_string())
            .collect();
        users.sort();
        users.dedup();
        users
    }

    /// Presence of `user_id`; `offline` if never seen.
    pub fn get_presence(&self, user_id: &str) -> PresenceStatus {
        self.inner.presence.get_presence(user_id)
    }

    /// Sets the presence of `user_id` and announces it to every connection.
    pub fn set_presence(&self, user_id: &str, status: PresenceStatus) -> usize {
        self.inner.presence.set_presence(user_id, status)
    }

    /// Snapshot of every known user's presence.
    pub fn get_all_presence(&self) -> HashMap<String, PresenceStatus> {
        self.inner.presence.get_all_presence()
    }

    /// Replaces the presence metadata of `user_id` and announces it.
    pub fn update_presence_metadata(
        &self,
        user_id: &str,
        metadata: Map<String, Value>,
    ) -> Result<usize> {
        self.inner.presence.update_metadata(user_id, metadata)
    }

    /// Presence of the members of `room` that are not `offline`.
    pub fn room_presence(&self, room: &str) -> Vec<PresenceInfo> {
        self.inner.presence.room_presence(room)
    }

    /// Registers an RPC method.
    pub fn register_rpc<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.inner.rpc.register(name, handler);
    }

    /// Invokes an RPC method.
    pub async fn call_rpc(&self, name: &str, params: Value) -> Result<Value> {
        self.inner.rpc.call(name, params).await
    }

    // ---- inbound path ----

    /// Entry point for every frame read from connection `id`.
    ///
    /// Every frame refreshes the sender's last-seen time. Heartbeat replies
    /// are consumed here. Control frames are ignored. Data frames are passed
    /// to [`EventHandler::on_message`].
    ///
    /// # Errors
    ///
    /// [`Error::ConnectionNotFound`] if `id` is no longer registered, or the
    /// handler's error.
    pub async fn handle_inbound(&self, id: &str, message: Message) -> Result<()> {
        let conn = self.inner.registry.get(id);
        if let Some(conn) = &conn {
            self.refresh_presence(conn);
        }

        if self.inner.heartbeat.handle_message(id, &message) {
            return Ok(());
        }
        if !message.msg_type.is_data() {
            debug!("Ignoring {} frame from {}", message.msg_type, id);
            return Ok(());
        }

        let conn = conn.ok_or_else(|| Error::ConnectionNotFound(id.to_string()))?;
        let handler = self.inner.handler.clone();
        handler.on_message(self, &conn, message).await
    }

    /// Runs the built-in envelope protocol for one frame from `conn`.
    ///
    /// The frame must hold a JSON envelope. `from` and `time` are stamped by
    /// the hub before routing. Any failure is reported back to the sender as
    /// an `error` envelope and returned; the connection stays open.
    pub async fn dispatch(&self, conn: &Connection, message: Message) -> Result<()> {
        let mut envelope = match Envelope::from_message(&message) {
            Ok(envelope) => envelope,
            Err(e) => {
                let e = Error::protocol(format!("malformed envelope: {}", e));
                self.reply_error(conn, None, &e);
                return Err(e);
            }
        };
        envelope.from = Some(conn.user_id().to_string());
        envelope.time = OffsetDateTime::now_utc();

        let correlation = envelope.id.clone();
        if let Err(e) = self.route(conn, envelope).await {
            self.reply_error(conn, correlation, &e);
            return Err(e);
        }
        Ok(())
    }

    async fn route(&self, conn: &Connection, envelope: Envelope) -> Result<()> {
        debug!("Routing {} envelope from {}", envelope.kind, conn.id());

        let kind = envelope.kind.clone();
        match kind.as_str() {
            kinds::JOIN_ROOM => self.join(required(&envelope.room, "room")?, conn.id()),
            kinds::LEAVE_ROOM => self.leave(required(&envelope.room, "room")?, conn.id()),
            kinds::ROOM_MESSAGE => {
                let room = required(&envelope.room, "room")?;
                self.broadcast_to_room(room, envelope.to_message()?)?;
                Ok(())
            }
            kinds::BROADCAST => {
                self.broadcast_except(envelope.to_message()?, conn.id());
                Ok(())
            }
            kinds::DIRECT_MESSAGE => {
                let to = required(&envelope.to, "to")?;
                self.send_to_user(to, envelope.to_message()?)?;
                Ok(())
            }
            kinds::PRESENCE => self.handle_presence(conn, envelope.data),
            kinds::RPC => self.handle_rpc(conn, envelope).await,
            other => Err(Error::protocol(format!("unknown message type: {}", other))),
        }
    }

    /// `data` is either a status string or an object with an optional
    /// `status` and an optional `metadata` object.
    fn handle_presence(&self, conn: &Connection, data: Value) -> Result<()> {
        let (status, metadata) = match data {
            Value::String(status) => (Some(status), None),
            Value::Object(mut fields) => {
                let status = match fields.remove("status") {
                    None | Some(Value::Null) => None,
                    Some(Value::String(status)) => Some(status),
                    Some(_) => return Err(Error::protocol("presence status must be a string")),
                };
                let metadata = match fields.remove("metadata") {
                    None | Some(Value::Null) => None,
                    Some(Value::Object(metadata)) => Some(metadata),
                    Some(_) => return Err(Error::protocol("presence metadata must be an object")),
                };
                (status, metadata)
            }
            _ => return Err(Error::protocol("presence data must be a status string or object")),
        };
        if status.is_none() && metadata.is_none() {
            return Err(Error::protocol("presence update carries neither status nor metadata"));
        }

        if let Some(status) = status {
            let status: PresenceStatus = status.parse()?;
            self.set_presence(conn.user_id(), status);
        }
        if let Some(metadata) = metadata {
            self.update_presence_metadata(conn.user_id(), metadata)?;
        }
        Ok(())
    }

    async fn handle_rpc(&self, conn: &Connection, envelope: Envelope) -> Result<()> {
        let request: RpcRequest = serde_json::from_value(envelope.data)
            .map_err(|e| Error::protocol(format!("invalid rpc request: {}", e)))?;

        let outcome = self.call_rpc(&request.method, request.params).await;
        if let Err(ref e) = outcome {
            debug!("RPC {} from {} failed: {}", request.method, conn.id(), e);
        }
        let response = RpcResponse::from_result(envelope.id.clone(), outcome);

        let mut reply = Envelope::new(kinds::RPC_RESPONSE, serde_json::to_value(&response)?);
        reply.from = Some(conn.id().clone());
        reply.id = envelope.id;
        self.send_to(conn.id(), reply.to_message()?)
    }

    fn reply_error(&self, conn: &Connection, id: Option<String>, error: &Error) {
        warn!("Rejected frame from {}: {}", conn.id(), error);

        let mut reply = Envelope::new(kinds::ERROR, json!({ "message": error.to_string() }));
        reply.id = id;
        match reply.to_message() {
            Ok(message) => {
                if let Err(e) = self.send_to(conn.id(), message) {
                    debug!("Could not report error to {}: {}", conn.id(), e);
                }
            }
            Err(e) => warn!("Failed to encode error envelope: {}", e),
        }
    }

    // ---- lifecycle ----

    /// Starts heartbeat supervision, and the presence sweep if configured.
    /// Timed-out connections are removed from the registry. Idempotent. Must
    /// be called from within a Tokio runtime.
    pub fn start(&self) {
        let weak = self.weak();
        self.inner.heartbeat.start(move |id: ConnectionId| {
            if let Some(inner) = weak.upgrade() {
                warn!("Connection {} timed out", id);
                inner.registry.remove(&id);
            }
        });

        let sweep = &self.inner.config.presence;
        if let Some(stale_after) = sweep.stale_after {
            self.inner.presence.start_cleanup(sweep.sweep_interval, stale_after);
        }
    }

    /// Returns `true` while heartbeat supervision runs.
    pub fn is_running(&self) -> bool {
        self.inner.heartbeat.is_running()
    }

    /// Stops heartbeat supervision and the presence sweep, then removes every
    /// connection, which closes their sessions.
    pub fn shutdown(&self) {
        self.inner.heartbeat.stop();
        self.inner.presence.stop_cleanup();
        let ids = self.inner.registry.ids();
        info!("Hub shutting down, closing {} connections", ids.len());
        for id in ids {
            self.inner.registry.remove(&id);
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("connections", &self.connection_count())
            .field("rooms", &self.room_count())
            .field("running", &self.is_running())
            .finish()
    }
}

fn required<'a>(field: &'a Option<String>, name: &str) -> Result<&'a str> {
    field
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::protocol(format!("missing field: {}", name)))
}
