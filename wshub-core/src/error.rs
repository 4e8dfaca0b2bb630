//! Error types and result handling for the hub.
//!
//! Every fallible operation in this crate returns [`Result<T>`], an alias for
//! `std::result::Result<T, Error>`.
//!
//! # Error Categories
//!
//! The variants fall into four groups, and each group has a fixed effect on
//! the rest of the hub:
//!
//! - **Transport** ([`Error::WebSocket`], [`Error::Io`]): a read or write on one
//!   socket failed. Fatal to that connection only; it is torn down at once.
//! - **Capacity** ([`Error::QueueFull`]): a connection's outbound queue is full.
//!   The slow consumer is dropped; the broadcaster never sees this error.
//! - **Not found** ([`Error::ConnectionNotFound`], [`Error::RoomNotFound`],
//!   [`Error::UserNotFound`], [`Error::MethodNotFound`]): returned to the
//!   caller, no other state changes.
//! - **Protocol** ([`Error::Protocol`], [`Error::InvalidMessage`],
//!   [`Error::Json`]): a malformed inbound frame. Logged and ignored; the
//!   connection stays alive.
//!
//! No error produced here is fatal to the process.
//!
//! # Examples
//!
//! ```
//! use wshub_core::error::{Error, Result};
//!
//! fn lookup(id: &str) -> Result<()> {
//!     Err(Error::ConnectionNotFound(id.to_string()))
//! }
//!
//! match lookup("conn_7") {
//!     Err(e) if e.is_not_found() => println!("gone: {}", e),
//!     Err(e) => eprintln!("unexpected: {}", e),
//!     Ok(()) => {}
//! }
//! ```

use std::fmt;
use thiserror::Error;

/// The main error type for hub operations.
#[derive(Debug, Error)]
pub enum Error {
    /// WebSocket protocol or transport failure.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Underlying I/O failure (socket bind, accept, ...).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization or deserialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The connection's outbound queue had no free slot.
    #[error("Outbound queue full for connection: {0}")]
    QueueFull(String),

    /// The connection's drain loop is gone; nothing can be delivered anymore.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// No connection is registered under this id.
    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    /// No room exists under this name.
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// The user has no live connections.
    #[error("User not found: {0}")]
    UserNotFound(String),

    /// No RPC method is registered under this name.
    #[error("RPC method not found: {0}")]
    MethodNotFound(String),

    /// Frame payload cannot be interpreted (e.g. binary where text is needed).
    #[error("Invalid message format")]
    InvalidMessage,

    /// Well-formed frame carrying an envelope the hub does not understand.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// An RPC handler reported a failure.
    #[error("RPC error: {0}")]
    Rpc(String),

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Catch-all for application errors.
    #[error("Custom error: {0}")]
    Custom(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a custom error from any displayable value.
    pub fn custom<T: fmt::Display>(msg: T) -> Self {
        Error::Custom(msg.to_string())
    }

    /// Creates a protocol error from any displayable value.
    pub fn protocol<T: fmt::Display>(msg: T) -> Self {
        Error::Protocol(msg.to_string())
    }

    /// Creates an RPC handler error from any displayable value.
    pub fn rpc<T: fmt::Display>(msg: T) -> Self {
        Error::Rpc(msg.to_string())
    }

    /// Creates a configuration error from any displayable value.
    pub fn config<T: fmt::Display>(msg: T) -> Self {
        Error::Config(msg.to_string())
    }

    /// Returns `true` for the not-found family of errors.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::ConnectionNotFound(_)
                | Error::RoomNotFound(_)
                | Error::UserNotFound(_)
                | Error::MethodNotFound(_)
        )
    }

    /// Returns `true` when the error means the connection it came from
    /// should be torn down.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            Error::WebSocket(_) | Error::Io(_) | Error::QueueFull(_) | Error::ConnectionClosed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_custom_error() {
        let err = Error::custom("test error");
        assert!(matches!(err, Error::Custom(_)));
        assert_eq!(err.to_string(), "Custom error: test error");
    }

    #[test]
    fn test_protocol_error() {
        let err = Error::protocol("unknown envelope type: dance");
        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(err.to_string(), "Protocol error: unknown envelope type: dance");
        assert!(!err.is_fatal_to_connection());
    }

    #[test]
    fn test_not_found_family() {
        assert!(Error::ConnectionNotFound("conn_1".into()).is_not_found());
        assert!(Error::RoomNotFound("general".into()).is_not_found());
        assert!(Error::UserNotFound("alice".into()).is_not_found());
        assert!(Error::MethodNotFound("sum".into()).is_not_found());
        assert!(!Error::QueueFull("conn_1".into()).is_not_found());
    }

    #[test]
    fn test_connection_not_found() {
        let err = Error::ConnectionNotFound("conn_123".to_string());
        assert_eq!(err.to_string(), "Connection not found: conn_123");
    }

    #[test]
    fn test_capacity_is_fatal_to_connection() {
        assert!(Error::QueueFull("conn_9".into()).is_fatal_to_connection());
        assert!(Error::ConnectionClosed("conn_9".into()).is_fatal_to_connection());
        assert!(!Error::RoomNotFound("lobby".into()).is_fatal_to_connection());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::Io(_)));
        assert!(err.is_fatal_to_connection());
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err = Error::from(json_err);
        assert!(matches!(err, Error::Json(_)));
    }
}
