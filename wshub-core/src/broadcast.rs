//! Fan-out delivery: everyone, one room, one user, or everyone but one.
//!
//! All delivery goes through [`deliver`], which enforces the hub's
//! backpressure policy: each enqueue is a non-blocking `try_send`, and a
//! connection whose outbound queue is full (or whose drain loop is gone) is
//! removed from the registry on the spot. The message is never dropped for the
//! other recipients and the caller never waits.
//!
//! Fan-out carries no ordering guarantee across connections. Within one
//! connection, frames are delivered in the order the router calls were made,
//! since every call appends to the same FIFO queue.

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::registry::Registry;
use std::sync::Arc;
use tracing::{debug, warn};

/// Queues `message` on every connection in `targets`, dropping any connection
/// that cannot take it. Returns the number of successful enqueues.
pub(crate) fn deliver<'a, I>(registry: &Registry, targets: I, message: &Message) -> usize
where
    I: IntoIterator<Item = &'a Connection>,
{
    let mut delivered = 0;
    let mut dropped = 0;

    for conn in targets {
        match conn.send(message.clone()) {
            Ok(()) => delivered += 1,
            Err(e) => {
                dropped += 1;
                warn!("Dropping connection {}: {}", conn.id(), e);
                registry.remove(conn.id());
            }
        }
    }

    debug!(
        "Delivered {} frame: {} queued, {} connections dropped",
        message.msg_type, delivered, dropped
    );
    delivered
}

/// Routes frames to sets of registered connections.
///
/// Every method returns the number of connections the frame was queued for.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use wshub_core::broadcast::Broadcaster;
/// use wshub_core::connection::Connection;
/// use wshub_core::message::Message;
/// use wshub_core::registry::Registry;
///
/// let registry = Arc::new(Registry::new());
/// let (conn, mut rx) = Connection::channel("conn_0", "alice", 4);
/// registry.add(conn);
///
/// let router = Broadcaster::new(registry.clone());
/// assert_eq!(router.broadcast(Message::text("hi")), 1);
/// assert_eq!(rx.try_recv().unwrap(), Message::text("hi"));
/// ```
#[derive(Clone)]
pub struct Broadcaster {
    registry: Arc<Registry>,
}

impl Broadcaster {
    /// Creates a router over `registry`.
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Returns the underlying registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Queues `message` for every registered connection.
    pub fn broadcast(&self, message: Message) -> usize {
        let targets = self.registry.all_connections();
        debug!("Broadcasting message to {} connections", targets.len());
        deliver(&self.registry, &targets, &message)
    }

    /// Queues `message` for every connection except `exclude_id`, typically
    /// the sender.
    pub fn broadcast_except(&self, message: Message, exclude_id: &str) -> usize {
        let targets: Vec<Connection> = self
            .registry
            .all_connections()
            .into_iter()
            .filter(|c| c.id() != exclude_id)
            .collect();
        debug!(
            "Broadcasting message to {} connections (except {})",
            targets.len(),
            exclude_id
        );
        deliver(&self.registry, &targets, &message)
    }

    /// Queues `message` for every member of `room`.
    ///
    /// # Errors
    ///
    /// [`Error::RoomNotFound`] if the room does not exist.
    pub fn broadcast_to_room(&self, room: &str, message: Message) -> Result<usize> {
        let members = self
            .registry
            .find_room(room)
            .ok_or_else(|| Error::RoomNotFound(room.to_string()))?;
        Ok(deliver(&self.registry, &members, &message))
    }

    /// Queues `message` for every member of `room` except `exclude_id`.
    ///
    /// # Errors
    ///
    /// [`Error::RoomNotFound`] if the room does not exist.
    pub fn broadcast_to_room_except(
        &self,
        room: &str,
        message: Message,
        exclude_id: &str,
    ) -> Result<usize> {
        let members = self
            .registry
            .find_room(room)
            .ok_or_else(|| Error::RoomNotFound(room.to_string()))?;
        let targets = members.iter().filter(|c| c.id() != exclude_id);
        Ok(deliver(&self.registry, targets, &message))
    }

    /// Queues `message` for every connection of `user_id` (all devices).
    ///
    /// # Errors
    ///
    /// [`Error::UserNotFound`] if the user has no live connection.
    pub fn send_to_user(&self, user_id: &str, message: Message) -> Result<usize> {
        let targets = self.registry.connections_for_user(user_id);
        if targets.is_empty() {
            return Err(Error::UserNotFound(user_id.to_string()));
        }
        Ok(deliver(&self.registry, &targets, &message))
    }

    /// Queues `message` for one connection.
    ///
    /// A full queue drops the connection, like every other delivery path; the
    /// call still succeeds.
    ///
    /// # Errors
    ///
    /// [`Error::ConnectionNotFound`] if `id` is not registered.
    pub fn send_to(&self, id: &str, message: Message) -> Result<()> {
        let conn = self
            .registry
            .get(id)
            .ok_or_else(|| Error::ConnectionNotFound(id.to_string()))?;
        deliver(&self.registry, [&conn], &message);
        Ok(())
    }
}
