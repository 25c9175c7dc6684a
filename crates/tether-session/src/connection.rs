//! Connection-side state machine.
//!
//! ```text
//! NotAuthenticated ──Auth──▶ Binding ──BindSuccess──▶ Bound
//!        │                     │                        │ ▲
//!     timeout               timeout / Auth       Inbound└─┘ (re-arm idle)
//!        ▼                     ▼                        │
//!      close                 close          timeout / Auth ──▶ close
//!
//! any state ──both halves finished──▶ Closed
//! ```
//!
//! Each live state owns exactly one timer (auth wait, bind wait, idle wait).
//! A timer reports its [`TimerKey`] when it fires; a key that does not match
//! the current state's timer is stale and ignored.
//!
//! [`transition`] is pure. [`Connection::handle`] applies its result under
//! the connection's own lock: cancelling, arming and re-arming timers. The
//! close request itself runs after the lock is released.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tether_protocol::{Message, Payload, PlayerId};
use tether_transport::ConnectionId;
use tether_wheel::{Expiry, TimeoutWheel, TimerKey};
use tracing::{debug, trace};

use crate::{Mediator, SessionHub};

// ---------------------------------------------------------------------------
// States, events, actions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    NotAuthenticated { timer: TimerKey },
    Binding { timer: TimerKey },
    Bound { timer: TimerKey },
    Closed,
}

impl ConnState {
    pub fn phase(&self) -> ConnPhase {
        match self {
            Self::NotAuthenticated { .. } => ConnPhase::NotAuthenticated,
            Self::Binding { .. } => ConnPhase::Binding,
            Self::Bound { .. } => ConnPhase::Bound,
            Self::Closed => ConnPhase::Closed,
        }
    }

    pub fn timer(&self) -> Option<TimerKey> {
        match *self {
            Self::NotAuthenticated { timer } | Self::Binding { timer } | Self::Bound { timer } => {
                Some(timer)
            }
            Self::Closed => None,
        }
    }
}

/// A state without its timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnPhase {
    NotAuthenticated,
    Binding,
    Bound,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnEvent {
    /// A `ClientAuth` arrived.
    Auth,
    /// The player side attached this connection.
    BindSuccess,
    /// An application message arrived.
    Inbound,
    /// A timer fired.
    Timeout(TimerKey),
    /// Both I/O halves have exited.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnAction {
    Ignore,
    /// Restart the idle timer.
    Rearm(TimerKey),
    /// Cancel the current timer and enter `next` with a fresh one.
    Advance { cancel: TimerKey, next: ConnPhase },
    /// Cancel the current timer, if it has not fired, and close.
    Close { cancel: Option<TimerKey> },
    /// Cancel the current timer, if any, and enter `Closed`.
    Finish { cancel: Option<TimerKey> },
}

pub fn transition(state: &ConnState, event: ConnEvent) -> ConnAction {
    use ConnAction::*;
    use ConnEvent as E;

    match (*state, event) {
        (ConnState::Closed, _) => Ignore,
        (s, E::Closed) => Finish { cancel: s.timer() },

        (ConnState::NotAuthenticated { timer }, E::Auth) => Advance {
            cancel: timer,
            next: ConnPhase::Binding,
        },
        (ConnState::Binding { timer }, E::BindSuccess) => Advance {
            cancel: timer,
            next: ConnPhase::Bound,
        },
        (ConnState::Binding { timer } | ConnState::Bound { timer }, E::Auth) => Close {
            cancel: Some(timer),
        },
        (ConnState::Bound { timer }, E::Inbound) => Rearm(timer),

        (
            ConnState::NotAuthenticated { timer }
            | ConnState::Binding { timer }
            | ConnState::Bound { timer },
            E::Timeout(key),
        ) if key == timer => Close { cancel: None },

        _ => Ignore,
    }
}

// ---------------------------------------------------------------------------
// Link
// ---------------------------------------------------------------------------

/// The player-side handle to a bound connection.
#[derive(Debug, Clone)]
pub struct Link {
    pub conn_id: ConnectionId,
    pub inbound: Arc<Mediator>,
    pub outbound: Arc<Mediator>,
}

impl Link {
    /// Both I/O tasks of the linked connection have exited.
    pub fn is_quiet(&self) -> bool {
        self.inbound.is_client_read_closed() && self.outbound.is_client_write_closed()
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// One live socket.
pub struct Connection {
    id: ConnectionId,
    state: Mutex<ConnState>,
    /// read loop → player
    inbound: Arc<Mediator>,
    /// player → write loop
    outbound: Arc<Mediator>,
    /// I/O tasks still running.
    halves: AtomicU8,
    close_requested: AtomicBool,
    player_id: OnceLock<PlayerId>,
    hub: Weak<SessionHub>,
    this: Weak<Connection>,
}

impl Connection {
    /// Creates a connection in `NotAuthenticated` with its auth timer armed.
    /// Does not register it; see [`SessionHub::open_connection`].
    pub(crate) fn new(hub: &Arc<SessionHub>, id: ConnectionId) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<Connection>| {
            let timer = hub.wheels().auth.insert(Arc::new(ConnTimeout { conn: this.clone() }));
            Self {
                id,
                state: Mutex::new(ConnState::NotAuthenticated { timer }),
                inbound: Arc::new(Mediator::new()),
                outbound: Arc::new(Mediator::new()),
                halves: AtomicU8::new(2),
                close_requested: AtomicBool::new(false),
                player_id: OnceLock::new(),
                hub: Arc::downgrade(hub),
                this: this.clone(),
            }
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnState {
        *self.state.lock()
    }

    pub fn phase(&self) -> ConnPhase {
        self.state.lock().phase()
    }

    pub fn inbound(&self) -> &Arc<Mediator> {
        &self.inbound
    }

    pub fn outbound(&self) -> &Arc<Mediator> {
        &self.outbound
    }

    pub fn link(&self) -> Link {
        Link {
            conn_id: self.id,
            inbound: Arc::clone(&self.inbound),
            outbound: Arc::clone(&self.outbound),
        }
    }

    /// The identity this connection authenticated as, if any.
    pub fn player_id(&self) -> Option<PlayerId> {
        self.player_id.get().copied()
    }

    pub(crate) fn claim(&self, uid: PlayerId) {
        let _ = self.player_id.set(uid);
    }

    pub fn is_close_requested(&self) -> bool {
        self.close_requested.load(Ordering::Acquire)
    }

    /// Asks both I/O tasks to stop. The write loop flushes what is queued
    /// before it exits.
    pub fn request_close(&self) {
        if !self.close_requested.swap(true, Ordering::AcqRel) {
            debug!(conn_id = %self.id, "close requested");
        }
        self.inbound.notify_close();
        self.outbound.notify_close();
    }

    /// Queues a server message for the write loop. Returns `false` if the
    /// write side has already closed.
    pub fn send(&self, payload: Payload) -> bool {
        let Some(hub) = self.hub.upgrade() else {
            return false;
        };
        let msg = hub.registry().acquire(payload);
        match self.outbound.add_message(msg) {
            Ok(()) => true,
            Err(msg) => {
                hub.registry().release(msg);
                false
            }
        }
    }

    /// Routes an application message from the read loop.
    ///
    /// Dropped before authentication, queued for the player while binding,
    /// queued and counted as activity once bound.
    pub fn deliver(&self, msg: Message) {
        let phase = self.phase();
        let refused = match phase {
            ConnPhase::NotAuthenticated | ConnPhase::Closed => Some(msg),
            ConnPhase::Binding | ConnPhase::Bound => self.inbound.add_message(msg).err(),
        };
        if let Some(msg) = refused {
            debug!(conn_id = %self.id, ?phase, protocol_id = %msg.protocol_id, "message dropped");
            if let Some(hub) = self.hub.upgrade() {
                hub.registry().release(msg);
            }
            return;
        }
        if phase == ConnPhase::Bound {
            self.handle(ConnEvent::Inbound);
        }
    }

    /// Feeds one event through the state machine.
    pub fn handle(&self, event: ConnEvent) -> ConnAction {
        let Some(hub) = self.hub.upgrade() else {
            return ConnAction::Ignore;
        };

        let action = {
            let mut state = self.state.lock();
            let action = transition(&state, event);
            match action {
                ConnAction::Ignore => {}
                ConnAction::Rearm(key) => {
                    hub.wheels().idle.rearm(key);
                }
                ConnAction::Advance { cancel, next } => {
                    if let Some(wheel) = wheel_for(&hub, state.phase()) {
                        wheel.remove(cancel);
                    }
                    *state = self.enter(&hub, next);
                }
                ConnAction::Close { cancel } | ConnAction::Finish { cancel } => {
                    if let (Some(key), Some(wheel)) = (cancel, wheel_for(&hub, state.phase())) {
                        wheel.remove(key);
                    }
                    if matches!(action, ConnAction::Finish { .. }) {
                        *state = ConnState::Closed;
                    }
                }
            }
            action
        };

        match action {
            ConnAction::Ignore => {
                trace!(conn_id = %self.id, ?event, "event ignored");
            }
            ConnAction::Close { .. } => {
                debug!(conn_id = %self.id, ?event, "closing connection");
                self.request_close();
            }
            ConnAction::Advance { next, .. } => {
                debug!(conn_id = %self.id, ?next, "connection state changed");
            }
            ConnAction::Rearm(_) | ConnAction::Finish { .. } => {}
        }
        action
    }

    fn enter(&self, hub: &SessionHub, next: ConnPhase) -> ConnState {
        let Some(wheel) = wheel_for(hub, next) else {
            return ConnState::Closed;
        };
        let timer = wheel.insert(Arc::new(ConnTimeout {
            conn: self.this.clone(),
        }));
        match next {
            ConnPhase::NotAuthenticated => ConnState::NotAuthenticated { timer },
            ConnPhase::Binding => ConnState::Binding { timer },
            ConnPhase::Bound => ConnState::Bound { timer },
            ConnPhase::Closed => ConnState::Closed,
        }
    }

    /// Marks one I/O task as finished. The second call removes the
    /// connection from the hub, releases whatever is still queued and
    /// enters `Closed`. Returns `true` for that second call.
    pub fn half_finished(&self) -> bool {
        if self.halves.fetch_sub(1, Ordering::AcqRel) != 1 {
            return false;
        }
        if let Some(hub) = self.hub.upgrade() {
            hub.forget_connection(self.id);
            let registry = hub.registry();
            for msg in self.inbound.drain().into_iter().chain(self.outbound.drain()) {
                registry.release(msg);
            }
        }
        self.handle(ConnEvent::Closed);
        debug!(conn_id = %self.id, "connection reclaimed");
        true
    }

    pub fn halves_running(&self) -> u8 {
        self.halves.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("halves", &self.halves_running())
            .finish()
    }
}

fn wheel_for(hub: &SessionHub, phase: ConnPhase) -> Option<&Arc<TimeoutWheel>> {
    let wheels = hub.wheels();
    match phase {
        ConnPhase::NotAuthenticated => Some(&wheels.auth),
        ConnPhase::Binding => Some(&wheels.bind),
        ConnPhase::Bound => Some(&wheels.idle),
        ConnPhase::Closed => None,
    }
}

struct ConnTimeout {
    conn: Weak<Connection>,
}

impl Expiry for ConnTimeout {
    fn release(&self, key: TimerKey) {
        if let Some(conn) = self.conn.upgrade() {
            conn.handle(ConnEvent::Timeout(key));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(wheel: &TimeoutWheel) -> TimerKey {
        wheel.insert(Arc::new(|_k: TimerKey| {}))
    }

    fn keys() -> (TimerKey, TimerKey) {
        let w = TimeoutWheel::new(tether_wheel::WheelConfig::new(
            "t",
            std::time::Duration::from_secs(1),
            10,
        ))
        .unwrap();
        (key(&w), key(&w))
    }

    #[test]
    fn test_transition_auth_from_not_authenticated_advances_to_binding() {
        let (t, _) = keys();
        let s = ConnState::NotAuthenticated { timer: t };
        assert_eq!(
            transition(&s, ConnEvent::Auth),
            ConnAction::Advance {
                cancel: t,
                next: ConnPhase::Binding
            }
        );
    }

    #[test]
    fn test_transition_second_auth_closes() {
        let (t, _) = keys();
        for s in [ConnState::Binding { timer: t }, ConnState::Bound { timer: t }] {
            assert_eq!(
                transition(&s, ConnEvent::Auth),
                ConnAction::Close { cancel: Some(t) }
            );
        }
    }

    #[test]
    fn test_transition_bind_success_only_in_binding() {
        let (t, _) = keys();
        assert_eq!(
            transition(&ConnState::Binding { timer: t }, ConnEvent::BindSuccess),
            ConnAction::Advance {
                cancel: t,
                next: ConnPhase::Bound
            }
        );
        assert_eq!(
            transition(&ConnState::NotAuthenticated { timer: t }, ConnEvent::BindSuccess),
            ConnAction::Ignore
        );
        assert_eq!(
            transition(&ConnState::Bound { timer: t }, ConnEvent::BindSuccess),
            ConnAction::Ignore
        );
    }

    #[test]
    fn test_transition_inbound_rearms_only_when_bound() {
        let (t, _) = keys();
        assert_eq!(
            transition(&ConnState::Bound { timer: t }, ConnEvent::Inbound),
            ConnAction::Rearm(t)
        );
        assert_eq!(
            transition(&ConnState::Binding { timer: t }, ConnEvent::Inbound),
            ConnAction::Ignore
        );
    }

    #[test]
    fn test_transition_current_timeout_closes_stale_ignored() {
        let (current, stale) = keys();
        for s in [
            ConnState::NotAuthenticated { timer: current },
            ConnState::Binding { timer: current },
            ConnState::Bound { timer: current },
        ] {
            assert_eq!(
                transition(&s, ConnEvent::Timeout(current)),
                ConnAction::Close { cancel: None }
            );
            assert_eq!(transition(&s, ConnEvent::Timeout(stale)), ConnAction::Ignore);
        }
    }

    #[test]
    fn test_transition_closed_finishes_every_live_state() {
        let (t, _) = keys();
        assert_eq!(
            transition(&ConnState::Bound { timer: t }, ConnEvent::Closed),
            ConnAction::Finish { cancel: Some(t) }
        );
        assert_eq!(
            transition(&ConnState::Closed, ConnEvent::Closed),
            ConnAction::Ignore
        );
    }

    #[test]
    fn test_transition_closed_is_terminal() {
        let (t, _) = keys();
        for e in [
            ConnEvent::Auth,
            ConnEvent::BindSuccess,
            ConnEvent::Inbound,
            ConnEvent::Timeout(t),
        ] {
            assert_eq!(transition(&ConnState::Closed, e), ConnAction::Ignore);
        }
    }
}
