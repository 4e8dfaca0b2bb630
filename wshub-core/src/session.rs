//! Per-socket read and drain loops.
//!
//! [`serve_connection`] owns one upgraded WebSocket for its whole life. It
//! registers a [`Connection`](crate::connection::Connection) with the hub, then
//! runs two tasks:
//!
//! - the **drain loop** pops frames off the outbound queue and writes them in
//!   order; once the connection is closed it sends a Close frame and stops
//! - the **read loop** feeds every inbound frame to
//!   [`Hub::handle_inbound`] until the peer closes, the transport fails or the
//!   connection is closed from the hub side
//!
//! Whichever loop ends first triggers the single teardown:
//! [`Hub::disconnect`], which is idempotent, so a heartbeat reap racing a read
//! error is harmless. It only removes the handle this session registered, so
//! a connection that replaced it under the same id stays registered.

use crate::connection::ConnectionId;
use crate::hub::Hub;
use crate::message::Message;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// How long teardown waits for the drain loop to flush its Close frame.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Serves one WebSocket until it disconnects. Returns the connection id that
/// was assigned.
///
/// Without a `user_id` the connection id doubles as the user id.
pub async fn serve_connection<S>(
    hub: &Hub,
    stream: WebSocketStream<S>,
    user_id: Option<String>,
    addr: Option<SocketAddr>,
) -> ConnectionId
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_sender, mut ws_receiver) = stream.split();
    let (conn, mut rx) = hub.open_connection(user_id);
    let conn = match addr {
        Some(addr) => conn.with_addr(addr),
        None => conn,
    };
    let conn_id = conn.id().clone();

    info!(
        "WebSocket connection established: {} ({}) from {:?}",
        conn_id,
        conn.user_id(),
        addr
    );
    hub.add_connection(conn.clone());

    let writer = conn.clone();
    let mut write_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                frame = rx.recv() => {
                    let Some(message) = frame else { break };
                    debug!("Sending {} frame to {}", message.msg_type, writer.id());
                    if let Err(e) = ws_sender.send(message.into_tungstenite()).await {
                        warn!("Failed to send message to {}: {}", writer.id(), e);
                        return;
                    }
                }
                _ = writer.closed() => {
                    let _ = ws_sender.send(Message::close().into_tungstenite()).await;
                    break;
                }
            }
        }
        let _ = ws_sender.close().await;
        debug!("Write task ended for {}", writer.id());
    });

    let reader = conn.clone();
    let read_hub = hub.clone();
    let mut read_task = tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                _ = reader.closed() => break,
                next = ws_receiver.next() => next,
            };
            match next {
                Some(Ok(frame)) => {
                    if frame.is_close() {
                        info!("Close message received from {}", reader.id());
                        break;
                    }
                    let message = Message::from_tungstenite(frame);
                    debug!("Received {} frame from {}", message.msg_type, reader.id());
                    if let Err(e) = read_hub.handle_inbound(reader.id(), message).await {
                        debug!("Inbound frame from {} not handled: {}", reader.id(), e);
                    }
                }
                Some(Err(e)) => {
                    warn!("WebSocket error for {}: {}", reader.id(), e);
                    break;
                }
                None => break,
            }
        }
        debug!("Read task ended for {}", reader.id());
    });

    tokio::select! {
        _ = &mut write_task => debug!("Write task finished first for {}", conn_id),
        _ = &mut read_task => debug!("Read task finished first for {}", conn_id),
    }

    hub.disconnect(&conn);
    conn.close();

    read_task.abort();
    if tokio::time::timeout(DRAIN_GRACE, &mut write_task).await.is_err() {
        write_task.abort();
    }

    info!("WebSocket connection closed: {}", conn_id);
    conn_id
}
