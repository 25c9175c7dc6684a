//! Session lifecycle for Tether.
//!
//! This crate keeps a player identity alive across connections:
//!
//! 1. **Connections** ([`Connection`]): one per socket, walking
//!    `NotAuthenticated → Binding → Bound`, each phase bounded by a timer.
//! 2. **Players** ([`Player`]): one per identity, walking
//!    `Offline → Binding → Online → Kicking → Offline`, unloaded after a
//!    long enough stay offline.
//! 3. **Rebind** ([`Coordinator`]): serializes binds and kicks per player so
//!    a new connection is attached only after the old one has gone quiet.
//! 4. **Hand-off queues** ([`Mediator`]): what the I/O tasks and the player
//!    logic exchange messages through.
//! 5. **Tokens** ([`TokenStore`]): one-shot auth tokens with a short
//!    lifetime.
//!
//! [`SessionHub`] owns all of it.
//!
//! # How it fits in the stack
//!
//! ```text
//! Server (above)          ← read/write loops feed the hub
//!     ↕
//! Session (this crate)    ← state machines, tables, timers
//!     ↕
//! Protocol, Wheel (below) ← messages and timeouts
//! ```

mod config;
mod connection;
mod error;
mod hub;
mod mediator;
mod player;
mod rebind;
mod shutdown;
mod token;

pub use config::{SessionConfig, WheelBuckets};
pub use connection::{
    ConnAction, ConnEvent, ConnPhase, ConnState, Connection, Link, transition as conn_transition,
};
pub use error::SessionError;
pub use hub::{SessionHub, Wheels};
pub use mediator::Mediator;
pub use player::{
    Player, PlayerAction, PlayerEvent, PlayerPhase, PlayerState, transition as player_transition,
};
pub use rebind::{Coordinator, Pending};
pub use shutdown::Shutdown;
pub use token::TokenStore;
