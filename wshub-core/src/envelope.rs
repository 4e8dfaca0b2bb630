//! Application-level envelope for routed messages.
//!
//! The envelope is not part of the wire protocol; it is the small JSON object
//! carried inside text frames when a message needs room or target routing:
//!
//! ```json
//! {"type": "room_message", "room": "general", "from": "alice",
//!  "data": {"text": "hi"}, "time": "2024-05-01T10:00:00Z"}
//! ```
//!
//! `type` is free-form, but the hub itself produces and consumes the kinds
//! listed in [`kinds`].

use crate::error::Result;
use crate::message::Message;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

/// Envelope `type` values understood or emitted by the hub.
pub mod kinds {
    /// A connection joined a room (sent to the room's other members).
    pub const USER_JOINED: &str = "user_joined";
    /// A connection left a room (sent to the room's remaining members).
    pub const USER_LEFT: &str = "user_left";
    /// A user's presence status changed (sent to everyone).
    pub const PRESENCE_CHANGED: &str = "presence_changed";
    /// Reply to an `rpc` request.
    pub const RPC_RESPONSE: &str = "rpc_response";
    /// Reply to a frame the hub could not process.
    pub const ERROR: &str = "error";

    /// Client asks to join `room`.
    pub const JOIN_ROOM: &str = "join_room";
    /// Client asks to leave `room`.
    pub const LEAVE_ROOM: &str = "leave_room";
    /// Client publishes to every member of `room`.
    pub const ROOM_MESSAGE: &str = "room_message";
    /// Client publishes to every other connection.
    pub const BROADCAST: &str = "broadcast";
    /// Client publishes to every connection of user `to`.
    pub const DIRECT_MESSAGE: &str = "direct_message";
    /// Client updates its own presence; `data` is the status string.
    pub const PRESENCE: &str = "presence";
    /// Client invokes a registered RPC method.
    pub const RPC: &str = "rpc";
}

/// A routed application message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message kind, see [`kinds`].
    #[serde(rename = "type")]
    pub kind: String,
    /// Target or origin room.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    /// Sender's user id; always stamped by the hub on inbound envelopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Target user id for direct messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Opaque payload.
    #[serde(default)]
    pub data: Value,
    /// Creation time.
    #[serde(with = "time::serde::rfc3339", default = "OffsetDateTime::now_utc")]
    pub time: OffsetDateTime,
    /// Correlation id, echoed back in RPC responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Envelope {
    /// Creates an envelope of the given kind, stamped with the current time.
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            room: None,
            from: None,
            to: None,
            data,
            time: OffsetDateTime::now_utc(),
            id: None,
        }
    }

    /// Creates a hub-originated notification, optionally scoped to a room.
    pub fn system(kind: &str, room: Option<&str>, data: Value) -> Self {
        let mut envelope = Self::new(kind, data);
        envelope.room = room.map(str::to_string);
        envelope
    }

    /// Sets the room.
    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = Some(room.into());
        self
    }

    /// Sets the target user.
    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    /// Sets the correlation id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Parses an envelope out of a text frame.
    pub fn from_message(message: &Message) -> Result<Self> {
        message.json()
    }

    /// Encodes the envelope as a text frame.
    pub fn to_message(&self) -> Result<Message> {
        Message::json_text(self)
    }
}
