//! Transport-level frames.
//!
//! A [`Message`] is one discrete unit of WebSocket data: text, binary, ping,
//! pong or close. The hub treats payloads as opaque bytes plus a type tag;
//! structured routing information lives one layer up in
//! [`Envelope`](crate::envelope::Envelope).
//!
//! Payloads are stored as [`Bytes`], so cloning a message for every recipient
//! of a broadcast only bumps a reference count.
//!
//! # Examples
//!
//! ```
//! use wshub_core::message::{Message, MessageType};
//!
//! let msg = Message::text("hello");
//! assert_eq!(msg.message_type(), MessageType::Text);
//! assert_eq!(msg.as_text(), Some("hello"));
//!
//! let frame = msg.into_tungstenite();
//! assert!(frame.is_text());
//! ```

use crate::error::{Error, Result};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;

/// The kind of a WebSocket frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// UTF-8 text frame.
    Text,
    /// Binary frame.
    Binary,
    /// Protocol-level ping (opcode 0x9).
    Ping,
    /// Protocol-level pong (opcode 0xA).
    Pong,
    /// Close frame.
    Close,
}

impl MessageType {
    /// Returns `true` for text and binary frames.
    pub fn is_data(self) -> bool {
        matches!(self, MessageType::Text | MessageType::Binary)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Text => "text",
            MessageType::Binary => "binary",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::Close => "close",
        };
        f.write_str(name)
    }
}

/// A single WebSocket frame: a type tag and an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Raw payload.
    pub data: Bytes,
    /// Frame kind.
    pub msg_type: MessageType,
}

impl Message {
    /// Creates a frame of the given type.
    pub fn new(msg_type: MessageType, data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            msg_type,
        }
    }

    /// Creates a text frame.
    pub fn text(text: impl Into<String>) -> Self {
        let text: String = text.into();
        Self::new(MessageType::Text, text)
    }

    /// Creates a binary frame.
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(MessageType::Binary, data)
    }

    /// Creates a ping frame.
    pub fn ping(data: impl Into<Bytes>) -> Self {
        Self::new(MessageType::Ping, data)
    }

    /// Creates a pong frame.
    pub fn pong(data: impl Into<Bytes>) -> Self {
        Self::new(MessageType::Pong, data)
    }

    /// Creates a close frame with no payload.
    pub fn close() -> Self {
        Self::new(MessageType::Close, Bytes::new())
    }

    /// Serializes `value` as JSON into a text frame.
    pub fn json_text<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::text(serde_json::to_string(value)?))
    }

    /// Converts into a tungstenite frame for the wire.
    pub fn into_tungstenite(self) -> TungsteniteMessage {
        match self.msg_type {
            MessageType::Text => {
                TungsteniteMessage::Text(String::from_utf8_lossy(&self.data).into_owned())
            }
            MessageType::Binary => TungsteniteMessage::Binary(self.data.to_vec()),
            MessageType::Ping => TungsteniteMessage::Ping(self.data.to_vec()),
            MessageType::Pong => TungsteniteMessage::Pong(self.data.to_vec()),
            MessageType::Close => TungsteniteMessage::Close(None),
        }
    }

    /// Converts a frame read from the wire.
    pub fn from_tungstenite(msg: TungsteniteMessage) -> Self {
        match msg {
            TungsteniteMessage::Text(text) => Self::text(text),
            TungsteniteMessage::Binary(data) => Self::binary(data),
            TungsteniteMessage::Ping(data) => Self::ping(data),
            TungsteniteMessage::Pong(data) => Self::pong(data),
            TungsteniteMessage::Close(_) => Self::close(),
            TungsteniteMessage::Frame(frame) => Self::binary(frame.into_data()),
        }
    }

    /// Returns the frame kind.
    pub fn message_type(&self) -> MessageType {
        self.msg_type
    }

    /// Returns `true` for text frames.
    pub fn is_text(&self) -> bool {
        self.msg_type == MessageType::Text
    }

    /// Returns `true` for binary frames.
    pub fn is_binary(&self) -> bool {
        self.msg_type == MessageType::Binary
    }

    /// Returns `true` for ping frames.
    pub fn is_ping(&self) -> bool {
        self.msg_type == MessageType::Ping
    }

    /// Returns `true` for pong frames.
    pub fn is_pong(&self) -> bool {
        self.msg_type == MessageType::Pong
    }

    /// Returns `true` for close frames.
    pub fn is_close(&self) -> bool {
        self.msg_type == MessageType::Close
    }

    /// Returns the payload as `&str` for valid UTF-8 text frames.
    pub fn as_text(&self) -> Option<&str> {
        if self.is_text() {
            std::str::from_utf8(&self.data).ok()
        } else {
            None
        }
    }

    /// Returns the raw payload.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Deserializes a text frame's payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        let text = self.as_text().ok_or(Error::InvalidMessage)?;
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_message() {
        let msg = Message::text("Hello, World!");
        assert!(msg.is_text());
        assert_eq!(msg.as_text(), Some("Hello, World!"));
        assert_eq!(msg.message_type(), MessageType::Text);
    }

    #[test]
    fn test_binary_message_has_no_text() {
        let msg = Message::binary(vec![0xff, 0xfe]);
        assert!(msg.is_binary());
        assert_eq!(msg.as_text(), None);
        assert_eq!(msg.as_bytes(), &[0xff, 0xfe]);
    }

    #[test]
    fn test_control_frames() {
        assert!(Message::ping(vec![]).is_ping());
        assert!(Message::pong("pong").is_pong());
        assert!(Message::close().is_close());
        assert!(!MessageType::Ping.is_data());
        assert!(MessageType::Binary.is_data());
    }

    #[test]
    fn test_json_parsing() {
        let msg = Message::text(r#"{"key":"value","number":42}"#);
        let json: serde_json::Value = msg.json().unwrap();
        assert_eq!(json["key"], "value");
        assert_eq!(json["number"], 42);
    }

    #[test]
    fn test_json_on_binary_is_invalid() {
        let msg = Message::binary(b"{}".to_vec());
        let err = msg.json::<serde_json::Value>().unwrap_err();
        assert!(matches!(err, Error::InvalidMessage));
    }

    #[test]
    fn test_pong_survives_tungstenite_conversion() {
        let frame = Message::pong("pong").into_tungstenite();
        assert!(frame.is_pong());
        let back = Message::from_tungstenite(frame);
        assert_eq!(back, Message::pong("pong"));
    }

    #[test]
    fn test_message_type_display() {
        assert_eq!(MessageType::Close.to_string(), "close");
        assert_eq!(MessageType::Text.to_string(), "text");
    }
}
