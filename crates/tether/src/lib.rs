//! # Tether
//!
//! A game-session server that keeps a player identity alive across
//! reconnects.
//!
//! Clients connect over TCP or WebSocket, authenticate with a short-lived
//! token, and are bound to their player. A second connection for the same
//! player takes over from the first; a player that stops sending
//! heartbeats is kicked, and one that stays offline long enough is
//! unloaded.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tether::TetherServer;
//!
//! # async fn run() -> Result<(), tether::TetherError> {
//! let server = TetherServer::builder()
//!     .tcp("0.0.0.0:59632")
//!     .ws("0.0.0.0:8080")
//!     .build()
//!     .await?;
//! server.run().await
//! # }
//! ```

mod config;
mod error;
mod handler;
mod server;

pub use config::{DEFAULT_TCP_ADDR, ServerConfig};
pub use error::TetherError;
pub use server::{TetherServer, TetherServerBuilder};

pub use tether_protocol as protocol;
pub use tether_session as session;
pub use tether_transport as transport;
