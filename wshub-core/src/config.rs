//! Hub, heartbeat and presence configuration.
//!
//! Each struct carries documented defaults, builder-style setters and a
//! `validate` step. They can also be loaded from JSON, where durations are
//! written in milliseconds and ping/pong payloads as strings:
//!
//! ```
//! use wshub_core::config::HubConfig;
//! use std::time::Duration;
//!
//! let config = HubConfig::from_json_str(
//!     r#"{"outbound_capacity": 64, "heartbeat": {"interval_ms": 5000, "timeout_ms": 15000}}"#,
//! ).unwrap();
//!
//! assert_eq!(config.outbound_capacity, 64);
//! assert_eq!(config.heartbeat.interval, Duration::from_secs(5));
//! assert!(config.heartbeat.use_protocol_ping);
//! ```

use crate::error::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default per-connection outbound queue capacity.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Heartbeat supervisor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Ping cadence; also the reaper's scan cadence.
    #[serde(rename = "interval_ms", with = "millis")]
    pub interval: Duration,
    /// Liveness window. A connection with no pong for longer than this is reaped.
    #[serde(rename = "timeout_ms", with = "millis")]
    pub timeout: Duration,
    /// Payload of outgoing pings.
    #[serde(with = "payload")]
    pub ping_payload: Bytes,
    /// Application-level pong sentinel, matched against inbound data frames.
    #[serde(with = "payload")]
    pub pong_payload: Bytes,
    /// Use the transport's ping opcode instead of a sentinel data frame.
    pub use_protocol_ping: bool,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(60),
            ping_payload: Bytes::from_static(b"ping"),
            pong_payload: Bytes::from_static(b"pong"),
            use_protocol_ping: true,
        }
    }
}

impl HeartbeatConfig {
    /// Sets the ping cadence.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the liveness window.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the ping and pong sentinel payloads.
    pub fn with_payloads(mut self, ping: impl Into<Bytes>, pong: impl Into<Bytes>) -> Self {
        self.ping_payload = ping.into();
        self.pong_payload = pong.into();
        self
    }

    /// Chooses between protocol-level and sentinel pings.
    pub fn with_protocol_ping(mut self, enabled: bool) -> Self {
        self.use_protocol_ping = enabled;
        self
    }

    /// Checks the invariants the supervisor relies on.
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(Error::config("heartbeat interval must be non-zero"));
        }
        if self.timeout <= self.interval {
            return Err(Error::config(format!(
                "heartbeat timeout ({:?}) must be greater than interval ({:?})",
                self.timeout, self.interval
            )));
        }
        if !self.use_protocol_ping && self.pong_payload.is_empty() {
            return Err(Error::config(
                "pong payload must not be empty when protocol ping is disabled",
            ));
        }
        Ok(())
    }
}

/// Stale-presence sweep settings. The sweep is off unless `stale_after` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Sweep cadence.
    #[serde(rename = "sweep_interval_ms", with = "millis")]
    pub sweep_interval: Duration,
    /// Users not seen for longer than this are marked offline.
    #[serde(rename = "stale_after_ms", with = "opt_millis")]
    pub stale_after: Option<Duration>,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            stale_after: None,
        }
    }
}

impl PresenceConfig {
    /// Enables the sweep with the given cadence and staleness window.
    pub fn with_sweep(mut self, interval: Duration, stale_after: Duration) -> Self {
        self.sweep_interval = interval;
        self.stale_after = Some(stale_after);
        self
    }

    /// Checks the sweep settings, given the heartbeat cadence that keeps
    /// connected users fresh.
    pub fn validate(&self, heartbeat: &HeartbeatConfig) -> Result<()> {
        let Some(stale_after) = self.stale_after else {
            return Ok(());
        };
        if self.sweep_interval.is_zero() {
            return Err(Error::config("presence sweep interval must be non-zero"));
        }
        if stale_after <= heartbeat.interval {
            return Err(Error::config(format!(
                "presence stale window ({:?}) must be greater than heartbeat interval ({:?})",
                stale_after, heartbeat.interval
            )));
        }
        Ok(())
    }
}

/// Settings for one hub instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Capacity of every connection's outbound queue.
    pub outbound_capacity: usize,
    /// Heartbeat supervisor settings.
    pub heartbeat: HeartbeatConfig,
    /// Presence sweep settings.
    pub presence: PresenceConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            heartbeat: HeartbeatConfig::default(),
            presence: PresenceConfig::default(),
        }
    }
}

impl HubConfig {
    /// Sets the outbound queue capacity.
    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity;
        self
    }

    /// Replaces the heartbeat settings.
    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Replaces the presence sweep settings.
    pub fn with_presence(mut self, presence: PresenceConfig) -> Self {
        self.presence = presence;
        self
    }

    /// Validates the whole configuration.
    pub fn validate(&self) -> Result<()> {
        if self.outbound_capacity == 0 {
            return Err(Error::config("outbound capacity must be at least 1"));
        }
        self.heartbeat.validate()?;
        self.presence.validate(&self.heartbeat)
    }

    /// Parses and validates a JSON configuration document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => super::millis::serialize(d, s),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}

mod payload {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Bytes, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&String::from_utf8_lossy(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
        String::deserialize(d).map(Bytes::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HubConfig::default();
        assert_eq!(config.outbound_capacity, 256);
        assert_eq!(config.heartbeat.interval, Duration::from_secs(30));
        assert_eq!(config.heartbeat.timeout, Duration::from_secs(60));
        assert_eq!(&config.heartbeat.ping_payload[..], b"ping");
        assert_eq!(&config.heartbeat.pong_payload[..], b"pong");
        assert!(config.heartbeat.use_protocol_ping);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_timeout_must_exceed_interval() {
        let config = HeartbeatConfig::default()
            .with_interval(Duration::from_secs(10))
            .with_timeout(Duration::from_secs(10));
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = HubConfig::default().with_outbound_capacity(0);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_sentinel_mode_needs_pong_payload() {
        let config = HeartbeatConfig::default()
            .with_protocol_ping(false)
            .with_payloads("ping", "");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_payloads_and_partial_document() {
        let config = HubConfig::from_json_str(
            r#"{"heartbeat": {"use_protocol_ping": false, "ping_payload": "__ping__", "pong_payload": "__pong__"}}"#,
        )
        .unwrap();
        assert_eq!(config.outbound_capacity, DEFAULT_OUTBOUND_CAPACITY);
        assert_eq!(&config.heartbeat.pong_payload[..], b"__pong__");
        assert_eq!(config.heartbeat.timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_json_rejects_invalid_windows() {
        let err = HubConfig::from_json_str(r#"{"heartbeat": {"interval_ms": 500, "timeout_ms": 100}}"#)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_presence_sweep_is_opt_in() {
        let config = HubConfig::from_json_str(
            r#"{"presence": {"sweep_interval_ms": 1000, "stale_after_ms": 90000}}"#,
        )
        .unwrap();
        assert_eq!(config.presence.stale_after, Some(Duration::from_secs(90)));
        assert_eq!(HubConfig::default().presence.stale_after, None);

        let too_short = HubConfig::default()
            .with_presence(PresenceConfig::default().with_sweep(Duration::from_secs(1), Duration::from_secs(30)));
        assert!(matches!(too_short.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_serialize_uses_millis() {
        let value = serde_json::to_value(HeartbeatConfig::default()).unwrap();
        assert_eq!(value["interval_ms"], 30_000);
        assert_eq!(value["pong_payload"], "pong");
    }
}
