//! Server configuration, loaded from TOML.
//!
//! ```toml
//! tcp_addr = "0.0.0.0:59632"
//! ws_addr = "0.0.0.0:8080"
//! max_connections = 2000
//!
//! [session]
//! heartbeat_interval_ms = 10000
//! ```
//!
//! Every field has a default. Session durations are in milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use tether_protocol::DEFAULT_MAX_FRAME_LEN;
use tether_session::SessionConfig;

use crate::TetherError;

pub const DEFAULT_TCP_ADDR: &str = "127.0.0.1:59632";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Plain TCP listener. `None` or an empty string disables it.
    pub tcp_addr: Option<String>,

    /// WebSocket listener. `None` or an empty string disables it.
    pub ws_addr: Option<String>,

    /// Accepted sockets beyond this many live connections are closed
    /// immediately.
    pub max_connections: usize,

    /// Largest frame accepted or sent, length prefix excluded.
    pub max_frame_len: usize,

    /// WebSocket keep-alive ping period.
    #[serde(rename = "ping_interval_ms", deserialize_with = "millis")]
    pub ping_interval: Duration,

    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tcp_addr: Some(DEFAULT_TCP_ADDR.to_string()),
            ws_addr: None,
            max_connections: 2000,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            ping_interval: Duration::from_secs(9),
            session: SessionConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Parses a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, TetherError> {
        Ok(toml::from_str(text)?)
    }

    /// Reads and parses a TOML file.
    pub fn load(path: &Path) -> Result<Self, TetherError> {
        let text = std::fs::read_to_string(path).map_err(|source| TetherError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}

fn millis<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    u64::deserialize(d).map(Duration::from_millis)
}
