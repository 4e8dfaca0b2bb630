//! Per-user presence tracking.
//!
//! Presence is the last-known state of a logical user, independent of which
//! of the user's connections reported it: a [`PresenceStatus`], the time the
//! user was last seen and free-form metadata. Users that were never seen read
//! as [`PresenceStatus::Offline`]. A user whose last connection goes away is
//! set to `offline` explicitly rather than forgotten, so the negative status
//! stays observable.
//!
//! Status changes go through [`PresenceTracker::transition`], which decides
//! and stores the new status under one gate. Concurrent transitions for the
//! same user therefore never interleave between the check and the write. The
//! `presence_changed` event is broadcast after the gate is released and
//! carries the state current at broadcast time.
//!
//! An optional sweep marks users `offline` once they have not been seen for
//! a configured window; see [`PresenceTracker::start_cleanup`].

use crate::broadcast::Broadcaster;
use crate::envelope::{Envelope, kinds};
use crate::error::{Error, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// A user's presence status. Any status may follow any other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    /// Connected and available.
    Online,
    /// Not connected, or never seen.
    #[default]
    Offline,
    /// Connected but idle.
    Away,
    /// Connected, do not disturb.
    Busy,
    /// Connected but appearing offline; interpretation is up to clients.
    Invisible,
}

impl PresenceStatus {
    /// Lowercase wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Offline => "offline",
            PresenceStatus::Away => "away",
            PresenceStatus::Busy => "busy",
            PresenceStatus::Invisible => "invisible",
        }
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PresenceStatus {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "online" => Ok(PresenceStatus::Online),
            "offline" => Ok(PresenceStatus::Offline),
            "away" => Ok(PresenceStatus::Away),
            "busy" => Ok(PresenceStatus::Busy),
            "invisible" => Ok(PresenceStatus::Invisible),
            other => Err(Error::protocol(format!("unknown presence status: {}", other))),
        }
    }
}

/// Everything known about one user. This is also the payload of
/// `presence_changed` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceInfo {
    /// The user.
    pub user_id: String,
    /// Current status.
    pub status: PresenceStatus,
    /// Last status change or activity.
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    /// Client-supplied metadata, e.g. a device name or a status line.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl PresenceInfo {
    fn new(user_id: &str, status: PresenceStatus) -> Self {
        Self {
            user_id: user_id.to_string(),
            status,
            last_seen: OffsetDateTime::now_utc(),
            metadata: Map::new(),
        }
    }

    /// `true` if not seen for longer than `window`.
    pub fn is_stale(&self, window: Duration) -> bool {
        let age = OffsetDateTime::now_utc() - self.last_seen;
        age.is_positive() && age.unsigned_abs() > window
    }
}

/// Tracks user presence and announces changes to every connection.
pub struct PresenceTracker {
    users: DashMap<String, PresenceInfo>,
    gate: Mutex<()>,
    broadcaster: Broadcaster,
    sweeper: Mutex<Option<CancellationToken>>,
}

impl PresenceTracker {
    /// Creates a tracker that announces through `broadcaster`.
    pub fn new(broadcaster: Broadcaster) -> Self {
        Self {
            users: DashMap::new(),
            gate: Mutex::new(()),
            broadcaster,
            sweeper: Mutex::new(None),
        }
    }

    /// Records `status` for `user_id` and broadcasts a `presence_changed`
    /// event. Returns the number of connections the event was queued for.
    pub fn set_presence(&self, user_id: &str, status: PresenceStatus) -> usize {
        self.transition(user_id, |_| Some(status)).unwrap_or(0)
    }

    /// Conditionally changes the status of `user_id`.
    ///
    /// `decide` sees the current status and returns the new one, or `None`
    /// to leave it alone. Deciding and storing happen under a gate shared by
    /// every transition, so `decide` may consult other state (such as the
    /// registry) without racing a concurrent transition. `decide` must not
    /// call back into the tracker.
    ///
    /// Returns the number of connections the event was queued for, or `None`
    /// if nothing changed.
    pub fn transition<F>(&self, user_id: &str, decide: F) -> Option<usize>
    where
        F: FnOnce(PresenceStatus) -> Option<PresenceStatus>,
    {
        {
            let _gate = self.gate.lock();
            let next = decide(self.get_presence(user_id))?;
            self.store(user_id, next);
            debug!("Presence of {} is now {}", user_id, next);
        }
        Some(self.announce(user_id))
    }

    fn store(&self, user_id: &str, status: PresenceStatus) {
        self.users
            .entry(user_id.to_string())
            .and_modify(|info| {
                info.status = status;
                info.last_seen = OffsetDateTime::now_utc();
            })
            .or_insert_with(|| PresenceInfo::new(user_id, status));
    }

    fn announce(&self, user_id: &str) -> usize {
        let Some(info) = self.get_info(user_id) else {
            return 0;
        };
        let event = serde_json::to_value(&info)
            .map_err(Error::from)
            .and_then(|data| Envelope::system(kinds::PRESENCE_CHANGED, None, data).to_message());
        match event {
            Ok(message) => self.broadcaster.broadcast(message),
            Err(e) => {
                error!("Failed to encode presence event for {}: {}", user_id, e);
                0
            }
        }
    }

    /// Returns the status of `user_id`; `offline` if never seen.
    pub fn get_presence(&self, user_id: &str) -> PresenceStatus {
        self.users
            .get(user_id)
            .map(|entry| entry.status)
            .unwrap_or_default()
    }

    /// Full record of `user_id`, if ever seen.
    pub fn get_info(&self, user_id: &str) -> Option<PresenceInfo> {
        self.users.get(user_id).map(|entry| entry.value().clone())
    }

    /// Snapshot of every known user's status, including explicit `offline`s.
    pub fn get_all_presence(&self) -> HashMap<String, PresenceStatus> {
        self.users
            .iter()
            .map(|entry| (entry.key().clone(), entry.status))
            .collect()
    }

    /// Number of users whose status is anything but `offline`.
    pub fn online_count(&self) -> usize {
        self.users
            .iter()
            .filter(|entry| entry.status != PresenceStatus::Offline)
            .count()
    }

    /// Marks `user_id` as seen now without changing its status or
    /// broadcasting. Returns `false` for unknown users.
    pub fn touch(&self, user_id: &str) -> bool {
        match self.users.get_mut(user_id) {
            Some(mut info) => {
                info.last_seen = OffsetDateTime::now_utc();
                true
            }
            None => false,
        }
    }

    /// Replaces the metadata of `user_id` and broadcasts a
    /// `presence_changed` event carrying it.
    ///
    /// # Errors
    ///
    /// [`Error::UserNotFound`] if the user was never seen.
    pub fn update_metadata(&self, user_id: &str, metadata: Map<String, Value>) -> Result<usize> {
        {
            let mut info = self
                .users
                .get_mut(user_id)
                .ok_or_else(|| Error::UserNotFound(user_id.to_string()))?;
            info.metadata = metadata;
            info.last_seen = OffsetDateTime::now_utc();
        }
        debug!("Presence metadata of {} updated", user_id);
        Ok(self.announce(user_id))
    }

    /// Presence of the members of `room` that are not `offline`, one entry
    /// per user, sorted by user id.
    pub fn room_presence(&self, room: &str) -> Vec<PresenceInfo> {
        let mut users: Vec<String> = self
            .broadcaster
            .registry()
            .room_members(room)
            .iter()
            .map(|conn| conn.user_id().to_string())
            .collect();
        users.sort();
        users.dedup();

        users
            .iter()
            .filter_map(|user| self.get_info(user))
            .filter(|info| info.status != PresenceStatus::Offline)
            .collect()
    }

    /// Number of distinct members of `room` that are not `offline`.
    pub fn room_online_count(&self, room: &str) -> usize {
        self.room_presence(room).len()
    }

    /// Marks every user not seen within `stale_after` as `offline` and
    /// announces each change. Returns the affected users, sorted.
    pub fn cleanup_stale(&self, stale_after: Duration) -> Vec<String> {
        let mut candidates: Vec<String> = self
            .users
            .iter()
            .filter(|entry| entry.status != PresenceStatus::Offline && entry.is_stale(stale_after))
            .map(|entry| entry.key().clone())
            .collect();
        candidates.sort();

        candidates.retain(|user| {
            self.transition(user, |current| {
                let stale = self.users.get(user).is_some_and(|info| info.is_stale(stale_after));
                (current != PresenceStatus::Offline && stale).then_some(PresenceStatus::Offline)
            })
            .is_some()
        });
        if !candidates.is_empty() {
            info!("Marked {} stale users offline", candidates.len());
        }
        candidates
    }

    /// Spawns a task running [`cleanup_stale`](Self::cleanup_stale) every
    /// `interval`. A running sweep is left alone. The task ends on
    /// [`stop_cleanup`](Self::stop_cleanup) or once the tracker is dropped.
    /// Must be called from within a Tokio runtime.
    pub fn start_cleanup(self: &Arc<Self>, interval: Duration, stale_after: Duration) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            debug!("Presence sweep already running");
            return;
        }
        let token = CancellationToken::new();
        *sweeper = Some(token.clone());
        drop(sweeper);

        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(this) = weak.upgrade() else { break };
                        this.cleanup_stale(stale_after);
                    }
                }
            }
            debug!("Presence sweep stopped");
        });
        info!(
            "Presence sweep started (interval: {:?}, stale after: {:?})",
            interval, stale_after
        );
    }

    /// Stops the sweep started by [`start_cleanup`](Self::start_cleanup).
    pub fn stop_cleanup(&self) {
        if let Some(token) = self.sweeper.lock().take() {
            token.cancel();
        }
    }

    /// Returns `true` while the sweep runs.
    pub fn is_sweeping(&self) -> bool {
        self.sweeper.lock().is_some()
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        if let Some(token) = self.sweeper.get_mut().take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::registry::Registry;
    use serde_json::json;

    fn tracker() -> (Arc<Registry>, PresenceTracker) {
        let registry = Arc::new(Registry::new());
        let tracker = PresenceTracker::new(Broadcaster::new(registry.clone()));
        (registry, tracker)
    }

    fn backdate(tracker: &PresenceTracker, user_id: &str, by: Duration) {
        let mut info = tracker.users.get_mut(user_id).unwrap();
        info.last_seen -= by;
    }

    #[test]
    fn test_set_then_get() {
        let (_registry, tracker) = tracker();
        tracker.set_presence("alice", PresenceStatus::Away);
        assert_eq!(tracker.get_presence("alice"), PresenceStatus::Away);
        assert_eq!(tracker.get_presence("alice").to_string(), "away");
    }

    #[test]
    fn test_unknown_user_is_offline() {
        let (_registry, tracker) = tracker();
        assert_eq!(tracker.get_presence("stranger"), PresenceStatus::Offline);
        assert!(tracker.get_info("stranger").is_none());
        assert!(tracker.get_all_presence().is_empty());
    }

    #[test]
    fn test_offline_stays_observable() {
        let (_registry, tracker) = tracker();
        tracker.set_presence("bob", PresenceStatus::Online);
        tracker.set_presence("bob", PresenceStatus::Offline);

        let all = tracker.get_all_presence();
        assert_eq!(all.get("bob"), Some(&PresenceStatus::Offline));
        assert_eq!(tracker.online_count(), 0);
    }

    #[test]
    fn test_change_is_broadcast() {
        let (registry, tracker) = tracker();
        let (conn, mut rx) = Connection::channel("conn_0", "carol", 4);
        registry.add(conn);

        assert_eq!(tracker.set_presence("dave", PresenceStatus::Busy), 1);
        let event = Envelope::from_message(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(event.kind, kinds::PRESENCE_CHANGED);
        assert_eq!(event.data["user_id"], "dave");
        assert_eq!(event.data["status"], "busy");
        assert!(event.data["last_seen"].is_string());
    }

    #[test]
    fn test_any_transition_allowed() {
        let (_registry, tracker) = tracker();
        for status in [
            PresenceStatus::Invisible,
            PresenceStatus::Online,
            PresenceStatus::Busy,
            PresenceStatus::Offline,
            PresenceStatus::Away,
        ] {
            tracker.set_presence("erin", status);
            assert_eq!(tracker.get_presence("erin"), status);
        }
    }

    #[test]
    fn test_declined_transition_is_silent() {
        let (registry, tracker) = tracker();
        let (conn, mut rx) = Connection::channel("conn_0", "carol", 4);
        registry.add(conn);
        tracker.set_presence("frank", PresenceStatus::Busy);
        let _ = rx.try_recv();

        let changed = tracker.transition("frank", |current| {
            (current == PresenceStatus::Offline).then_some(PresenceStatus::Online)
        });
        assert!(changed.is_none());
        assert_eq!(tracker.get_presence("frank"), PresenceStatus::Busy);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_metadata_update_is_broadcast() {
        let (registry, tracker) = tracker();
        let (conn, mut rx) = Connection::channel("conn_0", "carol", 4);
        registry.add(conn);

        let mut metadata = Map::new();
        metadata.insert("device".into(), json!("phone"));
        let err = tracker.update_metadata("grace", metadata.clone()).unwrap_err();
        assert!(matches!(err, Error::UserNotFound(_)));

        tracker.set_presence("grace", PresenceStatus::Online);
        let _ = rx.try_recv();
        assert_eq!(tracker.update_metadata("grace", metadata).unwrap(), 1);

        let event = Envelope::from_message(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(event.kind, kinds::PRESENCE_CHANGED);
        assert_eq!(event.data["metadata"]["device"], "phone");
        assert_eq!(event.data["status"], "online");
        assert_eq!(tracker.get_info("grace").unwrap().metadata["device"], "phone");
    }

    #[test]
    fn test_touch_refreshes_last_seen_only() {
        let (_registry, tracker) = tracker();
        assert!(!tracker.touch("heidi"));

        tracker.set_presence("heidi", PresenceStatus::Away);
        backdate(&tracker, "heidi", Duration::from_secs(60));
        let before = tracker.get_info("heidi").unwrap().last_seen;

        assert!(tracker.touch("heidi"));
        let info = tracker.get_info("heidi").unwrap();
        assert!(info.last_seen > before);
        assert_eq!(info.status, PresenceStatus::Away);
    }

    #[test]
    fn test_room_presence_counts_online_users_once() {
        let (registry, tracker) = tracker();
        let mut receivers = Vec::new();
        for (id, user) in [("conn_0", "ivan"), ("conn_1", "ivan"), ("conn_2", "judy"), ("conn_3", "mallory")] {
            let (conn, rx) = Connection::channel(id, user, 16);
            registry.add(conn);
            registry.join("general", id).unwrap();
            receivers.push(rx);
        }
        tracker.set_presence("ivan", PresenceStatus::Online);
        tracker.set_presence("judy", PresenceStatus::Busy);
        tracker.set_presence("mallory", PresenceStatus::Offline);

        let users: Vec<String> = tracker
            .room_presence("general")
            .into_iter()
            .map(|info| info.user_id)
            .collect();
        assert_eq!(users, vec!["ivan", "judy"]);
        assert_eq!(tracker.room_online_count("general"), 2);
        assert_eq!(tracker.room_online_count("nowhere"), 0);
    }

    #[test]
    fn test_cleanup_stale_marks_offline() {
        let (_registry, tracker) = tracker();
        tracker.set_presence("ken", PresenceStatus::Online);
        tracker.set_presence("lena", PresenceStatus::Away);
        tracker.set_presence("mia", PresenceStatus::Offline);
        backdate(&tracker, "ken", Duration::from_secs(120));
        backdate(&tracker, "mia", Duration::from_secs(120));

        assert_eq!(tracker.cleanup_stale(Duration::from_secs(60)), vec!["ken".to_string()]);
        assert_eq!(tracker.get_presence("ken"), PresenceStatus::Offline);
        assert_eq!(tracker.get_presence("lena"), PresenceStatus::Away);
        assert!(tracker.cleanup_stale(Duration::from_secs(60)).is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_loop_sweeps_and_stops() {
        let (_registry, tracker) = tracker();
        let tracker = Arc::new(tracker);
        tracker.set_presence("nina", PresenceStatus::Online);
        backdate(&tracker, "nina", Duration::from_secs(10));

        tracker.start_cleanup(Duration::from_millis(10), Duration::from_secs(5));
        tracker.start_cleanup(Duration::from_millis(10), Duration::from_secs(5));
        assert!(tracker.is_sweeping());

        let started = Instant::now();
        while tracker.get_presence("nina") != PresenceStatus::Offline
            && started.elapsed() < Duration::from_secs(2)
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(tracker.get_presence("nina"), PresenceStatus::Offline);

        tracker.stop_cleanup();
        assert!(!tracker.is_sweeping());
        tracker.set_presence("nina", PresenceStatus::Online);
        backdate(&tracker, "nina", Duration::from_secs(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(tracker.get_presence("nina"), PresenceStatus::Online);
    }

    #[tokio::test]
    async fn test_cleanup_task_ends_with_tracker() {
        let (_registry, tracker) = tracker();
        let tracker = Arc::new(tracker);
        tracker.start_cleanup(Duration::from_millis(10), Duration::from_secs(5));
        tokio::time::sleep(Duration::from_millis(25)).await;

        let weak = Arc::downgrade(&tracker);
        drop(tracker);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_parse_status() {
        assert_eq!("Away".parse::<PresenceStatus>().unwrap(), PresenceStatus::Away);
        assert_eq!(" invisible ".parse::<PresenceStatus>().unwrap(), PresenceStatus::Invisible);
        assert!(matches!("sleeping".parse::<PresenceStatus>(), Err(Error::Protocol(_))));
    }
}
