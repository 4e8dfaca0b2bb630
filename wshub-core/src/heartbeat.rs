//! Liveness supervision.
//!
//! The [`HeartbeatSupervisor`] keeps one `last_pong` timestamp per registered
//! connection and runs two independent periodic tasks:
//!
//! - the **ping sender** queues a ping on every supervised connection each
//!   `interval`; a ping that cannot be queued reaps the connection at once
//! - the **reaper** scans the timestamps each `interval` and reaps every entry
//!   older than `timeout`
//!
//! Reaping deletes the entry and then invokes the timeout callback. Since the
//! entry is removed under the map's shard lock before the callback runs, each
//! timeout episode fires the callback exactly once, even when the ping sender
//! and the reaper race. The callback is the only path back to the registry.
//!
//! Per connection: `Registered → (pong)* → TimedOut → Removed`. Registering
//! the same id again after a reap starts a fresh episode.
//!
//! # Examples
//!
//! ```
//! use std::sync::{Arc, Weak};
//! use wshub_core::config::HeartbeatConfig;
//! use wshub_core::heartbeat::HeartbeatSupervisor;
//! use wshub_core::message::Message;
//! use wshub_core::registry::Registry;
//!
//! let supervisor = HeartbeatSupervisor::new(HeartbeatConfig::default(), Arc::new(Registry::new()));
//! supervisor.register_connection("conn_0");
//! assert!(supervisor.is_active("conn_0"));
//!
//! assert!(supervisor.handle_message("conn_0", &Message::pong(Vec::new())));
//! assert!(!supervisor.handle_message("conn_0", &Message::text("hello")));
//! ```

use crate::config::HeartbeatConfig;
use crate::connection::ConnectionId;
use crate::message::{Message, MessageType};
use crate::registry::Registry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::{Arc, Weak};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Invoked with the id of every reaped connection.
pub type TimeoutCallback = Arc<dyn Fn(ConnectionId) + Send + Sync>;

/// Snapshot of the supervisor's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HeartbeatStats {
    /// Supervised connections.
    pub total_connections: usize,
    /// Supervised connections still inside the liveness window.
    pub active_connections: usize,
}

/// Pings connections and reaps the ones that stop answering.
pub struct HeartbeatSupervisor {
    config: HeartbeatConfig,
    registry: Arc<Registry>,
    last_pong: DashMap<ConnectionId, Instant>,
    on_timeout: RwLock<Option<TimeoutCallback>>,
    running: Mutex<Option<CancellationToken>>,
}

impl HeartbeatSupervisor {
    /// Creates a stopped supervisor. Pings are queued on connections looked up
    /// in `registry`.
    pub fn new(config: HeartbeatConfig, registry: Arc<Registry>) -> Self {
        Self {
            config,
            registry,
            last_pong: DashMap::new(),
            on_timeout: RwLock::new(None),
            running: Mutex::new(None),
        }
    }

    /// Returns the active configuration.
    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    /// Starts supervising `id`, with its liveness window starting now.
    pub fn register_connection(&self, id: &str) {
        self.last_pong.insert(id.to_string(), Instant::now());
        debug!("Heartbeat registered for {}", id);
    }

    /// Stops supervising `id` without invoking the timeout callback.
    /// Returns `false` if it was not supervised.
    pub fn unregister_connection(&self, id: &str) -> bool {
        let removed = self.last_pong.remove(id).is_some();
        if removed {
            debug!("Heartbeat unregistered for {}", id);
        }
        removed
    }

    /// Refreshes the liveness timestamp of `id`.
    ///
    /// Returns `false` if `id` is not supervised; a late pong never revives a
    /// reaped entry.
    pub fn update_pong(&self, id: &str) -> bool {
        match self.last_pong.get_mut(id) {
            Some(mut last) => {
                let now = Instant::now();
                if now > *last {
                    *last = now;
                }
                true
            }
            None => false,
        }
    }

    /// Records a pong for `id`.
    pub fn handle_pong(&self, id: &str) -> bool {
        self.update_pong(id)
    }

    /// Consumes `message` if it is a heartbeat reply.
    ///
    /// Protocol-level pongs and data frames whose payload equals the
    /// configured pong sentinel refresh `id`'s timestamp and return `true`.
    /// Anything else returns `false` so the caller can process it as an
    /// application message.
    pub fn handle_message(&self, id: &str, message: &Message) -> bool {
        let is_pong = match message.msg_type {
            MessageType::Pong => true,
            MessageType::Text | MessageType::Binary => {
                message.data == self.config.pong_payload
            }
            MessageType::Ping | MessageType::Close => false,
        };
        if is_pong {
            self.update_pong(id);
        }
        is_pong
    }

    /// `true` iff `id` is supervised and answered within the liveness window.
    pub fn is_active(&self, id: &str) -> bool {
        self.last_pong
            .get(id)
            .is_some_and(|last| last.elapsed() < self.config.timeout)
    }

    /// Last liveness timestamp of `id`.
    pub fn last_pong(&self, id: &str) -> Option<Instant> {
        self.last_pong.get(id).map(|last| *last)
    }

    /// Counts supervised and live connections.
    pub fn stats(&self) -> HeartbeatStats {
        let now = Instant::now();
        let active = self
            .last_pong
            .iter()
            .filter(|entry| now.saturating_duration_since(*entry.value()) < self.config.timeout)
            .count();
        HeartbeatStats {
            total_connections: self.last_pong.len(),
            active_connections: active,
        }
    }

    /// Replaces the timeout callback.
    pub fn set_on_timeout(&self, callback: TimeoutCallback) {
        *self.on_timeout.write() = Some(callback);
    }

    /// Sets the timeout callback and spawns the ping and reaper tasks.
    ///
    /// Calling `start` on a running supervisor only replaces the callback.
    /// The tasks hold the supervisor weakly: they end on [`stop`](Self::stop)
    /// or once the last `Arc` is dropped. Must be called from within a Tokio
    /// runtime.
    pub fn start<F>(self: &Arc<Self>, on_timeout: F)
    where
        F: Fn(ConnectionId) + Send + Sync + 'static,
    {
        self.set_on_timeout(Arc::new(on_timeout));

        let mut running = self.running.lock();
        if running.is_some() {
            debug!("Heartbeat supervisor already running");
            return;
        }
        let token = CancellationToken::new();
        *running = Some(token.clone());
        drop(running);

        self.spawn_periodic("ping", token.clone(), |this| {
            this.send_pings();
        });
        self.spawn_periodic("reaper", token, |this| {
            this.reap_expired();
        });

        info!(
            "Heartbeat supervisor started (interval: {:?}, timeout: {:?})",
            self.config.interval, self.config.timeout
        );
    }

    /// Stops both periodic tasks. Supervised entries are kept.
    pub fn stop(&self) {
        if let Some(token) = self.running.lock().take() {
            token.cancel();
            info!("Heartbeat supervisor stopped");
        }
    }

    /// Returns `true` between [`start`](Self::start) and [`stop`](Self::stop).
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Runs one ping pass. Returns the number of pings queued.
    pub fn send_pings(&self) -> usize {
        let ids: Vec<ConnectionId> = self.last_pong.iter().map(|e| e.key().clone()).collect();
        let mut sent = 0;

        for id in ids {
            let Some(conn) = self.registry.get(&id) else {
                continue;
            };
            if conn.is_closed() {
                self.unregister_connection(&id);
                continue;
            }
            match conn.send(self.ping_frame()) {
                Ok(()) => sent += 1,
                Err(e) => {
                    warn!("Failed to send ping to {}: {}", id, e);
                    self.reap(&id);
                }
            }
        }

        if sent > 0 {
            debug!("Sent ping to {} connections", sent);
        }
        sent
    }

    /// Runs one reaper pass. Returns the ids that timed out.
    pub fn reap_expired(&self) -> Vec<ConnectionId> {
        let now = Instant::now();
        let timeout = self.config.timeout;
        let mut expired = Vec::new();

        self.last_pong.retain(|id, last| {
            if now.saturating_duration_since(*last) > timeout {
                expired.push(id.clone());
                false
            } else {
                true
            }
        });

        for id in &expired {
            info!("Connection {} heartbeat timeout", id);
            self.fire_timeout(id);
        }
        expired
    }

    fn reap(&self, id: &str) {
        if self.last_pong.remove(id).is_some() {
            self.fire_timeout(id);
        }
    }

    fn fire_timeout(&self, id: &str) {
        let callback = self.on_timeout.read().clone();
        if let Some(callback) = callback {
            callback(id.to_string());
        }
    }

    fn ping_frame(&self) -> Message {
        let payload = self.config.ping_payload.clone();
        if self.config.use_protocol_ping {
            Message::ping(payload)
        } else if std::str::from_utf8(&payload).is_ok() {
            Message::new(MessageType::Text, payload)
        } else {
            Message::binary(payload)
        }
    }

    fn spawn_periodic(self: &Arc<Self>, name: &'static str, token: CancellationToken, pass: fn(&Self)) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(this) = weak.upgrade() else { break };
                        pass(&this);
                    }
                }
            }
            debug!("Heartbeat {} task stopped", name);
        });
    }
}

impl Drop for HeartbeatSupervisor {
    fn drop(&mut self) {
        if let Some(token) = self.running.get_mut().take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Allowance for timer and scheduler jitter on top of the reap bound.
    const SCHEDULING_SLACK: Duration = Duration::from_millis(40);

    fn fast_config() -> HeartbeatConfig {
        HeartbeatConfig::default()
            .with_interval(Duration::from_millis(50))
            .with_timeout(Duration::from_millis(150))
    }

    fn supervisor(config: HeartbeatConfig) -> (Arc<Registry>, Arc<HeartbeatSupervisor>) {
        let registry = Arc::new(Registry::new());
        let supervisor = Arc::new(HeartbeatSupervisor::new(config, registry.clone()));
        (registry, supervisor)
    }

    fn counting_callback() -> (Arc<AtomicUsize>, impl Fn(ConnectionId) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        (count, move |_id: ConnectionId| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_register_then_active() {
        let (_registry, hb) = supervisor(HeartbeatConfig::default());
        hb.register_connection("conn_0");
        assert!(hb.is_active("conn_0"));
        assert!(!hb.is_active("conn_1"));

        assert!(hb.unregister_connection("conn_0"));
        assert!(!hb.is_active("conn_0"));
        assert!(!hb.unregister_connection("conn_0"));
    }

    #[tokio::test]
    async fn test_pong_moves_timestamp_forward() {
        let (_registry, hb) = supervisor(fast_config());
        hb.register_connection("conn_0");
        let before = hb.last_pong("conn_0").unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(hb.handle_pong("conn_0"));
        let after = hb.last_pong("conn_0").unwrap();
        assert!(after > before);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(hb.handle_message("conn_0", &Message::text("pong")));
        assert!(hb.last_pong("conn_0").unwrap() > after);
    }

    #[test]
    fn test_handle_message_classification() {
        let config = HeartbeatConfig::default().with_payloads("__ping__", "__pong__");
        let (_registry, hb) = supervisor(config);
        hb.register_connection("conn_0");

        assert!(hb.handle_message("conn_0", &Message::pong(Vec::new())));
        assert!(hb.handle_message("conn_0", &Message::text("__pong__")));
        assert!(hb.handle_message("conn_0", &Message::binary(b"__pong__".to_vec())));
        assert!(!hb.handle_message("conn_0", &Message::text("pong")));
        assert!(!hb.handle_message("conn_0", &Message::ping(b"__pong__".to_vec())));
        assert!(!hb.handle_message("conn_0", &Message::close()));
    }

    #[test]
    fn test_late_pong_does_not_revive() {
        let (_registry, hb) = supervisor(fast_config());
        assert!(!hb.update_pong("conn_gone"));
        assert!(hb.last_pong("conn_gone").is_none());
    }

    #[tokio::test]
    async fn test_silent_connection_reaped_exactly_once() {
        let config = fast_config();
        let bound = config.interval + config.timeout;
        let (_registry, hb) = supervisor(config);
        let (count, callback) = counting_callback();
        hb.start(callback);
        hb.register_connection("conn_silent");
        let registered = hb.last_pong("conn_silent").unwrap();

        while count.load(Ordering::SeqCst) == 0 && registered.elapsed() < Duration::from_secs(2) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let reaped_after = registered.elapsed();
        assert!(
            reaped_after <= bound + SCHEDULING_SLACK,
            "reaped after {:?}, bound {:?}",
            reaped_after,
            bound
        );

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!hb.is_active("conn_silent"));
        hb.stop();
    }

    #[tokio::test]
    async fn test_responsive_connection_survives() {
        let (_registry, hb) = supervisor(fast_config());
        let (count, callback) = counting_callback();
        hb.register_connection("conn_chatty");
        hb.start(callback);

        let started = Instant::now();
        while started.elapsed() < Duration::from_millis(500) {
            hb.update_pong("conn_chatty");
            tokio::time::sleep(Duration::from_millis(30)).await;
        }

        assert!(hb.is_active("conn_chatty"));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        hb.stop();
    }

    #[test]
    fn test_reaper_pass_and_reregistration() {
        let config = HeartbeatConfig::default()
            .with_interval(Duration::from_millis(1))
            .with_timeout(Duration::from_millis(2));
        let (_registry, hb) = supervisor(config);
        let (count, callback) = counting_callback();
        hb.set_on_timeout(Arc::new(callback));

        hb.register_connection("conn_0");
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(hb.reap_expired(), vec!["conn_0".to_string()]);
        assert!(hb.reap_expired().is_empty());
        assert_eq!(count.load(Ordering::SeqCst), 1);

        hb.register_connection("conn_0");
        assert!(hb.is_active("conn_0"));
    }

    #[test]
    fn test_ping_failure_reaps_immediately() {
        let (registry, hb) = supervisor(HeartbeatConfig::default());
        let (count, callback) = counting_callback();
        hb.set_on_timeout(Arc::new(callback));

        let (conn, _rx) = Connection::channel("conn_full", "alice", 1);
        conn.send_text("backlog").unwrap();
        registry.add(conn);
        hb.register_connection("conn_full");

        assert_eq!(hb.send_pings(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(hb.last_pong("conn_full").is_none());
    }

    #[tokio::test]
    async fn test_ping_frame_shapes() {
        let (registry, hb) = supervisor(HeartbeatConfig::default());
        let (conn, mut rx) = Connection::channel("conn_0", "alice", 4);
        registry.add(conn);
        hb.register_connection("conn_0");
        assert_eq!(hb.send_pings(), 1);
        assert_eq!(rx.recv().await.unwrap(), Message::ping("ping"));

        let sentinel = HeartbeatConfig::default().with_protocol_ping(false);
        let (registry, hb) = supervisor(sentinel);
        let (conn, mut rx) = Connection::channel("conn_1", "bob", 4);
        registry.add(conn);
        hb.register_connection("conn_1");
        hb.send_pings();
        assert_eq!(rx.recv().await.unwrap(), Message::text("ping"));
    }

    #[test]
    fn test_ping_failure_racing_reaper_fires_once() {
        const ROUNDS: usize = 500;
        let (registry, hb) = supervisor(fast_config());
        let (count, callback) = counting_callback();
        hb.set_on_timeout(Arc::new(callback));

        let (conn, _rx) = Connection::channel("conn_full", "alice", 1);
        conn.send_text("backlog").unwrap();
        registry.add(conn);

        let expired = Duration::from_secs(1);
        for round in 1..=ROUNDS {
            hb.last_pong
                .insert("conn_full".to_string(), Instant::now() - expired);
            let barrier = std::sync::Barrier::new(2);

            std::thread::scope(|scope| {
                scope.spawn(|| {
                    barrier.wait();
                    hb.send_pings();
                });
                scope.spawn(|| {
                    barrier.wait();
                    hb.reap_expired();
                });
            });

            assert_eq!(count.load(Ordering::SeqCst), round, "round {}", round);
            assert!(hb.last_pong("conn_full").is_none());
        }
    }

    #[tokio::test]
    async fn test_dropping_supervisor_ends_tasks() {
        let (registry, hb) = supervisor(
            HeartbeatConfig::default()
                .with_interval(Duration::from_millis(10))
                .with_timeout(Duration::from_secs(5)),
        );
        let (conn, mut rx) = Connection::channel("conn_0", "alice", 64);
        registry.add(conn);
        hb.register_connection("conn_0");
        let (_count, callback) = counting_callback();
        hb.start(callback);
        assert_eq!(Arc::strong_count(&hb), 1);

        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();

        let weak = Arc::downgrade(&hb);
        drop(hb);
        assert!(weak.upgrade().is_none());

        tokio::time::sleep(Duration::from_millis(30)).await;
        while rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_stats() {
        let (_registry, hb) = supervisor(HeartbeatConfig::default());
        hb.register_connection("conn_0");
        hb.register_connection("conn_1");
        let stats = hb.stats();
        assert_eq!(stats.total_connections, 2);
        assert_eq!(stats.active_connections, 2);
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_halts() {
        let (_registry, hb) = supervisor(fast_config());
        let (_count, callback) = counting_callback();
        hb.start(callback);
        let (_count2, callback2) = counting_callback();
        hb.start(callback2);
        assert!(hb.is_running());

        hb.stop();
        assert!(!hb.is_running());
        hb.register_connection("conn_0");
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(hb.last_pong("conn_0").is_some());
    }
}
