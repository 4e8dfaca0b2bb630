//! Authoritative index of live connections and room membership.
//!
//! The [`Registry`] owns two maps behind a single reader-writer lock:
//!
//! - `connections`: connection id → [`Connection`]
//! - `rooms`: room name → set of connection ids
//!
//! Every mutation updates both sides of a membership under the same write
//! lock, so for every registered id, `id ∈ rooms[r]` iff the connection's
//! membership cache contains `r`. A room is deleted as soon as its last member
//! leaves.
//!
//! Nothing here blocks on I/O while the lock is held. Join/leave
//! notifications are built from a snapshot and queued only after the lock has
//! been released.

use crate::broadcast;
use crate::connection::{Connection, ConnectionId};
use crate::envelope::{Envelope, kinds};
use crate::error::{Error, Result};
use parking_lot::RwLock;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Called once for every connection that actually leaves the registry.
pub type RemovalHook = Arc<dyn Fn(&Connection) + Send + Sync>;

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, Connection>,
    rooms: HashMap<String, HashSet<ConnectionId>>,
}

/// Rooms a detached connection was in, each with the members left behind.
type Departures = Vec<(String, Vec<Connection>)>;

impl Inner {
    /// Unlinks `id` from both maps. Must be called with the write lock held.
    fn detach(&mut self, id: &str) -> Option<(Connection, Departures)> {
        let conn = self.connections.remove(id)?;
        let joined: Vec<String> = std::mem::take(&mut *conn.room_cache().write())
            .into_iter()
            .collect();

        let mut departures = Vec::with_capacity(joined.len());
        for room in joined {
            let Some(members) = self.rooms.get_mut(&room) else {
                continue;
            };
            members.remove(id);
            if members.is_empty() {
                self.rooms.remove(&room);
                departures.push((room, Vec::new()));
            } else {
                let peers = members
                    .iter()
                    .filter_map(|m| self.connections.get(m).cloned())
                    .collect();
                departures.push((room, peers));
            }
        }

        Some((conn, departures))
    }

    fn members_of(&self, room: &str) -> Option<Vec<Connection>> {
        self.rooms.get(room).map(|ids| {
            ids.iter()
                .filter_map(|id| self.connections.get(id).cloned())
                .collect()
        })
    }
}

/// Thread-safe registry of connections and rooms.
///
/// # Examples
///
/// ```
/// use wshub_core::connection::Connection;
/// use wshub_core::registry::Registry;
///
/// let registry = Registry::new();
/// let (alice, _rx) = Connection::channel("conn_0", "alice", 8);
/// registry.add(alice);
///
/// registry.join("general", "conn_0").unwrap();
/// assert_eq!(registry.room_count(), 1);
///
/// registry.remove("conn_0");
/// assert_eq!(registry.count(), 0);
/// assert_eq!(registry.room_count(), 0);
/// ```
pub struct Registry {
    inner: RwLock<Inner>,
    on_remove: RwLock<Option<RemovalHook>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            on_remove: RwLock::new(None),
        }
    }

    /// Installs the hook invoked after each effective removal.
    ///
    /// The hook runs without the registry lock held, so it may call back into
    /// the registry.
    pub fn set_removal_hook(&self, hook: RemovalHook) {
        *self.on_remove.write() = Some(hook);
    }

    /// Registers a connection, inserting it into every room its membership
    /// cache already lists. Returns the number of registered connections.
    ///
    /// A duplicate id is a caller bug: the previous entry is detached and
    /// closed without running the removal hook, and the new connection takes
    /// its place. The owner of the old handle should let go of it with
    /// [`remove_handle`](Self::remove_handle), which leaves the replacement
    /// registered.
    pub fn add(&self, conn: Connection) -> usize {
        let id = conn.id.clone();
        let rooms = conn.rooms();

        let (count, replaced) = {
            let mut inner = self.inner.write();
            let replaced = inner.detach(&id).map(|(old, _)| old);

            // The old entry may share this connection's cache; restore it.
            conn.room_cache().write().extend(rooms.iter().cloned());
            for room in &rooms {
                inner.rooms.entry(room.clone()).or_default().insert(id.clone());
            }
            inner.connections.insert(id.clone(), conn.clone());
            (inner.connections.len(), replaced)
        };

        if let Some(old) = replaced {
            warn!("Duplicate connection id {}; replacing existing entry", id);
            if !old.same_handle(&conn) {
                old.close();
            }
        }

        info!("Added connection: {} (Total: {})", id, count);
        count
    }

    /// Unregisters a connection.
    ///
    /// Removes it from every room (deleting rooms left empty), closes it,
    /// notifies the remaining members of each room with `user_left`, then runs
    /// the removal hook. Returns the removed connection, or `None` if the id
    /// was not registered; calling this twice is harmless.
    pub fn remove(&self, id: &str) -> Option<Connection> {
        self.remove_if(id, |_| true)
    }

    /// Like [`remove`](Self::remove), but only if the entry registered under
    /// `conn`'s id is `conn` itself rather than a replacement.
    pub fn remove_handle(&self, conn: &Connection) -> Option<Connection> {
        self.remove_if(&conn.id, |current| current.same_handle(conn))
    }

    fn remove_if<F>(&self, id: &str, matches: F) -> Option<Connection>
    where
        F: FnOnce(&Connection) -> bool,
    {
        let detached = {
            let mut inner = self.inner.write();
            if inner.connections.get(id).is_some_and(matches) {
                inner.detach(id)
            } else {
                None
            }
        };
        let Some((conn, departures)) = detached else {
            debug!("Remove for unknown or replaced connection {} ignored", id);
            return None;
        };

        conn.close();
        info!("Removed connection: {} (Total: {})", id, self.count());

        for (room, peers) in departures {
            if !peers.is_empty() {
                self.notify(kinds::USER_LEFT, &room, conn.user_id(), &peers);
            }
        }

        let hook = self.on_remove.read().clone();
        if let Some(hook) = hook {
            hook(&conn);
        }

        Some(conn)
    }

    /// Adds connection `id` to `room`, creating the room if needed.
    ///
    /// The room's other members receive a `user_joined` notification. Joining
    /// a room twice is a no-op.
    ///
    /// # Errors
    ///
    /// [`Error::ConnectionNotFound`] if `id` is not registered.
    pub fn join(&self, room: &str, id: &str) -> Result<()> {
        let (conn, peers) = {
            let mut guard = self.inner.write();
            let inner = &mut *guard;
            let conn = inner
                .connections
                .get(id)
                .cloned()
                .ok_or_else(|| Error::ConnectionNotFound(id.to_string()))?;

            let members = inner.rooms.entry(room.to_string()).or_default();
            if !members.insert(id.to_string()) {
                debug!("Connection {} already in room {}", id, room);
                return Ok(());
            }
            conn.room_cache().write().insert(room.to_string());

            let peers: Vec<Connection> = members
                .iter()
                .filter(|m| m.as_str() != id)
                .filter_map(|m| inner.connections.get(m).cloned())
                .collect();
            (conn, peers)
        };

        info!("User {} ({}) joined room {}", conn.user_id(), id, room);
        self.notify(kinds::USER_JOINED, room, conn.user_id(), &peers);
        Ok(())
    }

    /// Removes connection `id` from `room`, deleting the room if it becomes
    /// empty. The remaining members receive a `user_left` notification.
    ///
    /// # Errors
    ///
    /// [`Error::ConnectionNotFound`] or [`Error::RoomNotFound`] when either
    /// side does not exist.
    pub fn leave(&self, room: &str, id: &str) -> Result<()> {
        let (conn, peers) = {
            let mut guard = self.inner.write();
            let inner = &mut *guard;
            let conn = inner
                .connections
                .get(id)
                .cloned()
                .ok_or_else(|| Error::ConnectionNotFound(id.to_string()))?;
            let members = inner
                .rooms
                .get_mut(room)
                .ok_or_else(|| Error::RoomNotFound(room.to_string()))?;

            if !members.remove(id) {
                debug!("Connection {} was not in room {}", id, room);
                return Ok(());
            }
            conn.room_cache().write().remove(room);

            let remaining: Vec<ConnectionId> = members.iter().cloned().collect();
            if remaining.is_empty() {
                inner.rooms.remove(room);
            }
            let peers: Vec<Connection> = remaining
                .iter()
                .filter_map(|m| inner.connections.get(m).cloned())
                .collect();
            (conn, peers)
        };

        info!("User {} ({}) left room {}", conn.user_id(), id, room);
        self.notify(kinds::USER_LEFT, room, conn.user_id(), &peers);
        Ok(())
    }

    /// Deletes a room, dropping every member's membership without
    /// notifications. Returns `false` if the room did not exist.
    pub fn delete_room(&self, room: &str) -> bool {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let Some(members) = inner.rooms.remove(room) else {
            return false;
        };
        for id in members {
            if let Some(conn) = inner.connections.get(&id) {
                conn.room_cache().write().remove(room);
            }
        }
        info!("Deleted room {}", room);
        true
    }

    /// Returns the connection registered under `id`.
    pub fn get(&self, id: &str) -> Option<Connection> {
        self.inner.read().connections.get(id).cloned()
    }

    /// Returns `true` if `id` is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().connections.contains_key(id)
    }

    /// Returns the members of `room`; empty if the room does not exist.
    pub fn room_members(&self, room: &str) -> Vec<Connection> {
        self.inner.read().members_of(room).unwrap_or_default()
    }

    /// Returns the members of `room`, or `None` if the room does not exist.
    pub fn find_room(&self, room: &str) -> Option<Vec<Connection>> {
        self.inner.read().members_of(room)
    }

    /// Number of registered connections.
    pub fn count(&self) -> usize {
        self.inner.read().connections.len()
    }

    /// Number of non-empty rooms.
    pub fn room_count(&self) -> usize {
        self.inner.read().rooms.len()
    }

    /// Number of members in `room`.
    pub fn room_size(&self, room: &str) -> usize {
        self.inner.read().rooms.get(room).map_or(0, HashSet::len)
    }

    /// Names of all rooms, in no particular order.
    pub fn rooms(&self) -> Vec<String> {
        self.inner.read().rooms.keys().cloned().collect()
    }

    /// Rooms joined by connection `id`, or `None` if it is not registered.
    pub fn rooms_of(&self, id: &str) -> Option<Vec<String>> {
        self.inner.read().connections.get(id).map(Connection::rooms)
    }

    /// Returns `true` if connection `id` is a member of `room`.
    pub fn is_member(&self, room: &str, id: &str) -> bool {
        self.inner
            .read()
            .rooms
            .get(room)
            .is_some_and(|members| members.contains(id))
    }

    /// Returns `true` if any connection of `user_id` is a member of `room`.
    pub fn is_user_in_room(&self, room: &str, user_id: &str) -> bool {
        let inner = self.inner.read();
        inner.rooms.get(room).is_some_and(|members| {
            members.iter().any(|id| {
                inner
                    .connections
                    .get(id)
                    .is_some_and(|c| c.user_id() == user_id)
            })
        })
    }

    /// All connections belonging to `user_id` (one per device).
    pub fn connections_for_user(&self, user_id: &str) -> Vec<Connection> {
        self.inner
            .read()
            .connections
            .values()
            .filter(|c| c.user_id() == user_id)
            .cloned()
            .collect()
    }

    /// Snapshot of every registered connection.
    pub fn all_connections(&self) -> Vec<Connection> {
        self.inner.read().connections.values().cloned().collect()
    }

    /// Ids of every registered connection.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.inner.read().connections.keys().cloned().collect()
    }

    fn notify(&self, kind: &str, room: &str, user_id: &str, peers: &[Connection]) {
        if peers.is_empty() {
            return;
        }
        let envelope = Envelope::system(kind, Some(room), json!({ "user_id": user_id }));
        match envelope.to_message() {
            Ok(message) => {
                broadcast::deliver(self, peers, &message);
            }
            Err(e) => error!("Failed to encode {} notification for {}: {}", kind, room, e),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
