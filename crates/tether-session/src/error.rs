//! Error types for the session layer.

use tether_protocol::PlayerId;

/// Errors that can occur in the session layer.
///
/// None of these are fatal to the process. Token and sequencing errors
/// close the offending connection; dispatch errors make the coordinator
/// re-queue or drop a request.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// No token is stored for this player: never issued, already used, or
    /// expired.
    #[error("no token issued for player {0}")]
    NoToken(PlayerId),

    /// The player's binder is still working on an earlier order.
    #[error("binder of player {0} is busy")]
    BinderBusy(PlayerId),

    /// The player has been unloaded and accepts no more orders.
    #[error("player {0} is unloaded")]
    PlayerUnloaded(PlayerId),

    /// A timer wheel could not be built from the configuration.
    #[error(transparent)]
    Wheel(#[from] tether_wheel::WheelError),
}
