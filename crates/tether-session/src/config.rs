//! Session timing configuration.
//!
//! Every duration is written in milliseconds in config files
//! (`auth_wait_ms = 10000`) and held as a [`Duration`] in code. Every field
//! has a default, so an empty `[session]` table is valid.

use std::time::Duration;

use serde::Deserialize;
use tether_wheel::WheelConfig;

/// Timeouts and deadlines of the connection and player lifecycles.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a new connection may stay silent before sending `ClientAuth`.
    #[serde(rename = "auth_wait_ms", with = "millis")]
    pub auth_wait: Duration,

    /// How long an authenticated connection may wait to be bound.
    #[serde(rename = "bind_wait_ms", with = "millis")]
    pub bind_wait: Duration,

    /// How long a bound connection may go without any inbound message.
    #[serde(rename = "idle_wait_ms", with = "millis")]
    pub idle_wait: Duration,

    /// Expected client heartbeat period.
    #[serde(rename = "heartbeat_interval_ms", with = "millis")]
    pub heartbeat_interval: Duration,

    /// Heartbeat age at which an online player is kicked. Twice the
    /// heartbeat interval when unset.
    #[serde(rename = "kick_after_ms", with = "millis::option")]
    pub kick_after: Option<Duration>,

    /// How long an offline player stays loaded.
    #[serde(rename = "unload_after_ms", with = "millis")]
    pub unload_after: Duration,

    /// Age at which the coordinator drops a bind request, and the bound on
    /// the binder's hand-off for it.
    #[serde(rename = "bind_deadline_ms", with = "millis")]
    pub bind_deadline: Duration,

    /// Same as `bind_deadline`, for kicks.
    #[serde(rename = "kick_deadline_ms", with = "millis")]
    pub kick_deadline: Duration,

    /// Lifetime of an issued auth token.
    #[serde(rename = "token_lifetime_ms", with = "millis")]
    pub token_lifetime: Duration,

    /// Upper bound on one socket read, so the read loop can observe close
    /// and shutdown requests.
    #[serde(rename = "read_poll_ms", with = "millis")]
    pub read_poll: Duration,

    /// Hard deadline for flushing queued messages when a connection closes.
    #[serde(rename = "flush_deadline_ms", with = "millis")]
    pub flush_deadline: Duration,

    pub buckets: WheelBuckets,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auth_wait: Duration::from_secs(10),
            bind_wait: Duration::from_secs(10),
            idle_wait: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            kick_after: None,
            unload_after: Duration::from_secs(5 * 60),
            bind_deadline: Duration::from_secs(5),
            kick_deadline: Duration::from_secs(5),
            token_lifetime: Duration::from_secs(12),
            read_poll: Duration::from_millis(50),
            flush_deadline: Duration::from_secs(2),
            buckets: WheelBuckets::default(),
        }
    }
}

impl SessionConfig {
    pub fn kick_after(&self) -> Duration {
        self.kick_after.unwrap_or(self.heartbeat_interval * 2)
    }

    pub fn auth_wheel(&self) -> WheelConfig {
        WheelConfig::new("auth", self.auth_wait, self.buckets.auth)
    }

    pub fn bind_wheel(&self) -> WheelConfig {
        WheelConfig::new("bind", self.bind_wait, self.buckets.bind)
    }

    pub fn idle_wheel(&self) -> WheelConfig {
        WheelConfig::new("idle", self.idle_wait, self.buckets.idle)
    }

    pub fn kick_wheel(&self) -> WheelConfig {
        WheelConfig::new("kick", self.kick_after(), self.buckets.kick)
    }

    pub fn unload_wheel(&self) -> WheelConfig {
        WheelConfig::new("unload", self.unload_after, self.buckets.unload)
    }

    pub fn token_wheel(&self) -> WheelConfig {
        WheelConfig::new("token", self.token_lifetime, self.buckets.token)
    }
}

/// Bucket count of each timer wheel. A wheel's tick is its timeout divided
/// by its bucket count.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WheelBuckets {
    pub auth: usize,
    pub bind: usize,
    pub idle: usize,
    pub kick: usize,
    pub unload: usize,
    pub token: usize,
}

impl Default for WheelBuckets {
    fn default() -> Self {
        Self {
            auth: 100,
            bind: 100,
            idle: 300,
            kick: 200,
            unload: 300,
            token: 120,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer};

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
            Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
        }
    }
}
