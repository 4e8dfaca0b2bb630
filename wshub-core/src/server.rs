//! TCP listener and WebSocket handshake.
//!
//! [`Server`] accepts TCP connections, upgrades each one to a WebSocket and
//! hands it to [`serve_connection`] on its own task. The client picks its user
//! identity with the `user_id` query parameter of the upgrade request
//! (`ws://host:port/?user_id=alice`); without one, the connection id is used.
//!
//! # Examples
//!
//! ```no_run
//! use wshub_core::prelude::*;
//!
//! # async fn example() -> Result<()> {
//! let hub = Hub::new();
//! hub.register_rpc("echo", |params| async move { Ok(params) });
//!
//! Server::new(hub).listen("127.0.0.1:9000").await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{Error, Result};
use crate::hub::Hub;
use crate::session::serve_connection;
use percent_encoding::percent_decode_str;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// WebSocket server bound to one hub.
#[derive(Debug, Clone)]
pub struct Server {
    hub: Hub,
}

impl Server {
    /// Creates a server for `hub`.
    pub fn new(hub: Hub) -> Self {
        Self { hub }
    }

    /// Returns the hub.
    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Binds `addr` and serves until the process exits.
    ///
    /// # Errors
    ///
    /// Fails if `addr` does not parse or cannot be bound.
    pub async fn listen(&self, addr: impl AsRef<str>) -> Result<()> {
        let addr: SocketAddr = addr
            .as_ref()
            .parse()
            .map_err(|e| Error::custom(format!("Invalid address: {}", e)))?;

        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, CancellationToken::new()).await
    }

    /// Serves connections from `listener` until `shutdown` is cancelled, then
    /// shuts the hub down.
    ///
    /// Starts heartbeat supervision. Accept errors are logged and do not stop
    /// the server.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        self.hub.start();
        info!("WebSocket server listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let hub = self.hub.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_socket(hub, stream, peer_addr).await {
                                error!("Connection error from {}: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                },
            }
        }

        info!("WebSocket server stopping");
        self.hub.shutdown();
        Ok(())
    }
}

async fn handle_socket(hub: Hub, stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
    let mut user_id = None;
    let ws_stream = accept_hdr_async(
        stream,
        |request: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
            user_id = request.uri().query().and_then(user_id_from_query);
            Ok(response)
        },
    )
    .await?;

    debug!("Handshake with {} complete (user: {:?})", peer_addr, user_id);
    serve_connection(&hub, ws_stream, user_id, Some(peer_addr)).await;
    Ok(())
}

/// Extracts the percent-decoded `user_id` parameter from a query string.
/// Empty values count as absent.
pub fn user_id_from_query(query: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "user_id")
        .map(|(_, value)| {
            let value = value.replace('+', " ");
            percent_decode_str(&value).decode_utf8_lossy().into_owned()
        })
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::PresenceStatus;
    use futures_util::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message as Frame;

    #[test]
    fn test_user_id_from_query() {
        assert_eq!(user_id_from_query("user_id=alice"), Some("alice".to_string()));
        assert_eq!(
            user_id_from_query("room=x&user_id=j%C3%BCrgen+k"),
            Some("jürgen k".to_string())
        );
        assert_eq!(user_id_from_query("user_id="), None);
        assert_eq!(user_id_from_query("uid=alice"), None);
        assert_eq!(user_id_from_query(""), None);
    }

    #[tokio::test]
    async fn test_serve_accepts_and_stops() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hub = Hub::new();
        let server = Server::new(hub.clone());
        let shutdown = CancellationToken::new();

        let stop = shutdown.clone();
        let running = tokio::spawn(async move { server.serve(listener, stop).await });

        let url = format!("ws://{}/?user_id=alice", addr);
        let (mut client, _) = connect_async(url).await.unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(frame, Frame::Text(_)));
        assert_eq!(hub.get_presence("alice"), PresenceStatus::Online);
        assert!(hub.is_running());

        client
            .send(Frame::Text(r#"{"type":"join_room","room":"general"}"#.into()))
            .await
            .unwrap();

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(hub.connection_count(), 0);
        assert!(!hub.is_running());
    }

    #[tokio::test]
    async fn test_listen_rejects_bad_address() {
        let server = Server::new(Hub::new());
        let err = server.listen("not an address").await.unwrap_err();
        assert!(matches!(err, Error::Custom(_)));
    }
}
