//! Per-socket connection state.
//!
//! A [`Connection`] is the hub's handle to one live WebSocket. It carries the
//! connection's identity, a bounded outbound queue, a cached copy of its room
//! memberships and a close flag.
//!
//! # Architecture
//!
//! Every connection is served by two cooperating tasks that share nothing but
//! the outbound queue and the close flag:
//!
//! - **Read loop**: receives frames from the client and hands them to the hub
//! - **Drain loop**: pops frames off the outbound queue and writes them to the
//!   socket, in order
//!
//! Producers never wait on the socket. [`Connection::send`] is a non-blocking
//! `try_send`; when the queue is full it fails with
//! [`Error::QueueFull`] and the router drops the connection instead of
//! stalling the whole hub behind one slow reader.
//!
//! # Examples
//!
//! ```
//! use wshub_core::connection::Connection;
//! use wshub_core::message::Message;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> wshub_core::Result<()> {
//! let (conn, mut outbound) = Connection::channel("conn_0", "alice", 8);
//!
//! conn.send_text("hello")?;
//! assert_eq!(outbound.recv().await, Some(Message::text("hello")));
//!
//! conn.close();
//! conn.send_text("dropped silently")?;
//! assert!(conn.is_closed());
//! # Ok(())
//! # }
//! ```

use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::message::Message;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A unique identifier for a WebSocket connection.
///
/// Ids are handed out by [`Hub::next_connection_id`](crate::hub::Hub::next_connection_id)
/// and are never reused within a hub's lifetime.
pub type ConnectionId = String;

/// Metadata about a WebSocket connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Unique identifier for this connection
    pub id: ConnectionId,
    /// Logical identity; several connections may share it
    pub user_id: String,
    /// Socket address of the client, when known
    pub addr: Option<SocketAddr>,
    /// Unix timestamp when the connection was established
    pub connected_at: u64,
}

/// Handle to one live WebSocket connection.
///
/// `Connection` is cheaply cloneable; all clones share the same queue,
/// membership cache and close flag.
#[derive(Clone)]
pub struct Connection {
    /// Unique identifier for this connection
    pub id: ConnectionId,
    info: ConnectionInfo,
    sender: mpsc::Sender<Message>,
    rooms: Arc<RwLock<BTreeSet<String>>>,
    closed: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl Connection {
    /// Creates a connection around the producer side of an outbound queue.
    pub fn new(
        id: impl Into<ConnectionId>,
        user_id: impl Into<String>,
        sender: mpsc::Sender<Message>,
    ) -> Self {
        let id = id.into();
        let info = ConnectionInfo {
            id: id.clone(),
            user_id: user_id.into(),
            addr: None,
            connected_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        };

        Self {
            id,
            info,
            sender,
            rooms: Arc::new(RwLock::new(BTreeSet::new())),
            closed: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Creates a connection together with a fresh outbound queue of
    /// `capacity` slots, returning the consumer side for the drain loop.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero, like [`mpsc::channel`].
    pub fn channel(
        id: impl Into<ConnectionId>,
        user_id: impl Into<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(id, user_id, tx), rx)
    }

    /// Records the client's socket address.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.info.addr = Some(addr);
        self
    }

    /// Pre-populates room memberships before the connection is registered.
    ///
    /// [`Registry::add`](crate::registry::Registry::add) inserts the
    /// connection into each of these rooms.
    pub fn with_rooms<I, S>(self, rooms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rooms.write().extend(rooms.into_iter().map(Into::into));
        self
    }

    /// Queues a frame for delivery without waiting.
    ///
    /// Sends on a closed connection are no-ops and return `Ok(())`.
    ///
    /// # Errors
    ///
    /// - [`Error::QueueFull`] when the outbound queue has no free slot
    /// - [`Error::ConnectionClosed`] when the drain loop has gone away
    pub fn send(&self, message: Message) -> Result<()> {
        if self.is_closed() {
            debug!("Dropping {} frame for closed connection {}", message.msg_type, self.id);
            return Ok(());
        }

        self.sender.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => Error::QueueFull(self.id.clone()),
            TrySendError::Closed(_) => Error::ConnectionClosed(self.id.clone()),
        })
    }

    /// Queues a text frame.
    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(Message::text(text))
    }

    /// Queues a binary frame.
    pub fn send_binary(&self, data: impl Into<bytes::Bytes>) -> Result<()> {
        self.send(Message::binary(data))
    }

    /// Serializes `data` to JSON and queues it as a text frame.
    pub fn send_json<T: Serialize>(&self, data: &T) -> Result<()> {
        self.send(Message::json_text(data)?)
    }

    /// Queues an envelope as a text frame.
    pub fn send_envelope(&self, envelope: &Envelope) -> Result<()> {
        self.send(envelope.to_message()?)
    }

    /// Returns the unique identifier for this connection.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Returns the logical user identity.
    pub fn user_id(&self) -> &str {
        &self.info.user_id
    }

    /// Returns the connection metadata.
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Returns a snapshot of the rooms this connection has joined.
    ///
    /// The snapshot is a copy; it does not change if the connection joins or
    /// leaves rooms afterwards.
    pub fn rooms(&self) -> Vec<String> {
        self.rooms.read().iter().cloned().collect()
    }

    /// Returns `true` if the connection's membership cache lists `room`.
    pub fn in_room(&self, room: &str) -> bool {
        self.rooms.read().contains(room)
    }

    /// Number of frames currently waiting in the outbound queue.
    pub fn queued(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    /// Sets the close flag. Returns `true` only for the call that actually
    /// closed the connection.
    pub fn close(&self) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.shutdown.cancel();
        true
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    /// Returns `true` if both handles refer to the same underlying connection.
    pub(crate) fn same_handle(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.closed, &other.closed)
    }

    /// Membership cache; written only by the registry under its lock.
    pub(crate) fn room_cache(&self) -> &RwLock<BTreeSet<String>> {
        &self.rooms
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.info.user_id)
            .field("rooms", &*self.rooms.read())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_outbound_is_fifo() {
        let (conn, mut rx) = Connection::channel("conn_0", "alice", 4);
        conn.send_text("one").unwrap();
        conn.send_binary(vec![2]).unwrap();
        conn.send_text("three").unwrap();

        assert_eq!(rx.recv().await.unwrap(), Message::text("one"));
        assert_eq!(rx.recv().await.unwrap(), Message::binary(vec![2]));
        assert_eq!(rx.recv().await.unwrap(), Message::text("three"));
    }

    #[test]
    fn test_full_queue_is_capacity_error() {
        let (conn, _rx) = Connection::channel("conn_1", "bob", 1);
        conn.send_text("fits").unwrap();
        assert_eq!(conn.queued(), 1);

        let err = conn.send_text("overflow").unwrap_err();
        assert!(matches!(err, Error::QueueFull(ref id) if id == "conn_1"));
    }

    #[test]
    fn test_dropped_receiver_is_connection_closed() {
        let (conn, rx) = Connection::channel("conn_2", "carol", 1);
        drop(rx);
        let err = conn.send_text("nobody home").unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed(_)));
    }

    #[tokio::test]
    async fn test_close_is_set_once_and_silences_sends() {
        let (conn, mut rx) = Connection::channel("conn_3", "dave", 4);
        let other = conn.clone();

        assert!(conn.close());
        assert!(!other.close());
        assert!(other.is_closed());

        other.send_text("ignored").unwrap();
        drop(conn);
        drop(other);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_closed_future_resolves() {
        let (conn, _rx) = Connection::channel("conn_4", "erin", 1);
        let waiter = conn.clone();
        let handle = tokio::spawn(async move { waiter.closed().await });
        conn.close();
        handle.await.unwrap();
    }

    #[test]
    fn test_prepopulated_rooms_and_info() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let (conn, _rx) = Connection::channel("conn_5", "frank", 1);
        let conn = conn.with_addr(addr).with_rooms(["random", "general"]);

        assert_eq!(conn.rooms(), vec!["general".to_string(), "random".to_string()]);
        assert!(conn.in_room("general"));
        assert_eq!(conn.user_id(), "frank");
        assert_eq!(conn.info().addr, Some(addr));
    }
}
