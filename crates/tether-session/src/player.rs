//! Player-side state machine, binder task and logic task.
//!
//! ```text
//!            Bind                BindSuccess
//! Offline ─────────▶ Binding ─────────────────▶ Online ◀──┐
//!  │   ▲                │  BindAbandoned           │  │    │ KickAbandoned
//!  │   │                └──(linked: Online,        │  │ Kick / timeout
//!  │   │                    else Offline)          │  ▼    │
//!  │   └──────────────── KickSuccess ─────────── Kicking ──┘
//!  │ Unload / timeout                               │ Bind (supersedes)
//!  ▼                                                ▼
//! Unloading (terminal)                           Binding
//! ```
//!
//! All binds and kicks of one player run on its binder task, one order at a
//! time. The binder owns the hand-off: it stops the logic task, tells the old
//! connection to go away, waits for the old I/O tasks to exit and only then
//! attaches the new link.
//!
//! An abandoned bind leaves the player `Online` on its old link when one is
//! still attached, even though that link was already told to close. Until
//! the kick timer fires the player is online without a live connection;
//! the kick then detaches the stale link and the player goes `Offline`.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tether_protocol::{CloseReason, Message, Payload, PlayerId, ProtocolId};
use tether_wheel::{Expiry, TimeoutWheel, TimerKey};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::{Connection, Link, SessionError, SessionHub};

/// Wait for one inbound message in the logic loop.
const LOGIC_WAIT: Duration = Duration::from_millis(5);
/// First and longest pause while waiting for a hand-off to quiesce.
const QUIESCE_MIN: Duration = Duration::from_millis(1);
const QUIESCE_MAX: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// States, events, actions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Offline { unload_timer: TimerKey },
    Binding,
    Online { kick_timer: TimerKey },
    Kicking,
    Unloading,
}

impl PlayerState {
    pub fn phase(&self) -> PlayerPhase {
        match self {
            Self::Offline { .. } => PlayerPhase::Offline,
            Self::Binding => PlayerPhase::Binding,
            Self::Online { .. } => PlayerPhase::Online,
            Self::Kicking => PlayerPhase::Kicking,
            Self::Unloading => PlayerPhase::Unloading,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerPhase {
    Offline,
    Binding,
    Online,
    Kicking,
    Unloading,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerEvent {
    Bind,
    BindSuccess,
    /// The hand-off missed its deadline. `linked` tells whether the old link
    /// is still attached.
    BindAbandoned { linked: bool },
    Heartbeat,
    Kick,
    KickSuccess,
    /// The coordinator dropped the kick before dispatching it.
    KickAbandoned,
    Timeout(TimerKey),
    Unload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerAction {
    Ignore,
    /// Refresh the heartbeat time and restart the kick timer.
    Rearm(TimerKey),
    /// Cancel the current timer, if one is given, and enter `next`.
    Advance {
        cancel: Option<TimerKey>,
        next: PlayerPhase,
    },
}

pub fn transition(state: &PlayerState, event: PlayerEvent) -> PlayerAction {
    use PlayerAction::*;
    use PlayerEvent as E;
    use PlayerPhase as P;

    let advance = |cancel, next| Advance { cancel, next };

    match (*state, event) {
        (PlayerState::Offline { unload_timer }, E::Bind) => advance(Some(unload_timer), P::Binding),
        (PlayerState::Offline { unload_timer }, E::Unload) => {
            advance(Some(unload_timer), P::Unloading)
        }
        (PlayerState::Offline { unload_timer }, E::Timeout(key)) if key == unload_timer => {
            advance(None, P::Unloading)
        }

        (PlayerState::Binding, E::BindSuccess) => advance(None, P::Online),
        (PlayerState::Binding, E::BindAbandoned { linked: true }) => advance(None, P::Online),
        (PlayerState::Binding, E::BindAbandoned { linked: false }) => advance(None, P::Offline),

        (PlayerState::Online { kick_timer }, E::Heartbeat) => Rearm(kick_timer),
        (PlayerState::Online { kick_timer }, E::Bind) => advance(Some(kick_timer), P::Binding),
        (PlayerState::Online { kick_timer }, E::Kick) => advance(Some(kick_timer), P::Kicking),
        (PlayerState::Online { kick_timer }, E::Timeout(key)) if key == kick_timer => {
            advance(None, P::Kicking)
        }

        (PlayerState::Kicking, E::KickSuccess) => advance(None, P::Offline),
        (PlayerState::Kicking, E::KickAbandoned) => advance(None, P::Online),
        (PlayerState::Kicking, E::Bind) => advance(None, P::Binding),

        _ => Ignore,
    }
}

// ---------------------------------------------------------------------------
// Player
// ---------------------------------------------------------------------------

enum Order {
    Bind {
        conn: Arc<Connection>,
        created: Instant,
    },
    Unbind {
        created: Instant,
    },
}

/// One authenticated identity. Outlives any single connection.
pub struct Player {
    id: PlayerId,
    state: Mutex<PlayerState>,
    /// Leaf lock: read by the kick item under the wheel lock.
    last_heartbeat: Mutex<Instant>,
    link: Mutex<Option<Link>>,
    orders: mpsc::Sender<Order>,
    logic_generation: AtomicU64,
    logic_running: AtomicUsize,
    unloaded: watch::Sender<bool>,
    hub: Weak<SessionHub>,
    this: Weak<Player>,
}

impl Player {
    /// Creates an `Offline` player with its unload timer armed and spawns
    /// its binder task.
    pub(crate) fn spawn(hub: &Arc<SessionHub>, id: PlayerId) -> Arc<Self> {
        let (orders, rx) = mpsc::channel(1);
        let player = Arc::new_cyclic(|this: &Weak<Player>| {
            let unload_timer = hub.wheels().unload.insert(Arc::new(PlayerTimeout {
                player: this.clone(),
            }));
            Self {
                id,
                state: Mutex::new(PlayerState::Offline { unload_timer }),
                last_heartbeat: Mutex::new(Instant::now()),
                link: Mutex::new(None),
                orders,
                logic_generation: AtomicU64::new(0),
                logic_running: AtomicUsize::new(0),
                unloaded: watch::channel(false).0,
                hub: Arc::downgrade(hub),
                this: this.clone(),
            }
        });
        tokio::spawn(Arc::clone(&player).run_binder(rx, hub.shutdown().subscribe()));
        debug!(player_id = %id, "player loaded");
        player
    }

    pub fn id(&self) -> PlayerId {
        self.id
    }

    pub fn state(&self) -> PlayerState {
        *self.state.lock()
    }

    pub fn phase(&self) -> PlayerPhase {
        self.state.lock().phase()
    }

    pub fn is_online(&self) -> bool {
        self.phase() == PlayerPhase::Online
    }

    pub fn is_unloaded(&self) -> bool {
        *self.unloaded.borrow()
    }

    /// The currently attached link, if any.
    pub fn link(&self) -> Option<Link> {
        self.link.lock().clone()
    }

    pub fn last_heartbeat(&self) -> Instant {
        *self.last_heartbeat.lock()
    }

    fn heartbeat_age(&self) -> Duration {
        self.last_heartbeat.lock().elapsed()
    }

    /// Number of logic tasks that have not exited yet.
    pub fn logic_running(&self) -> usize {
        self.logic_running.load(Ordering::Acquire)
    }

    /// Queues a server message on the attached connection. Returns `false`
    /// when there is none or it no longer accepts writes.
    pub fn send(&self, payload: Payload) -> bool {
        let (Some(hub), Some(link)) = (self.hub.upgrade(), self.link()) else {
            return false;
        };
        let msg = hub.registry().acquire(payload);
        match link.outbound.add_message(msg) {
            Ok(()) => true,
            Err(msg) => {
                hub.registry().release(msg);
                false
            }
        }
    }

    /// Resolves once the player has been unloaded.
    pub async fn unloaded(&self) {
        let mut rx = self.unloaded.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Feeds one event through the state machine.
    pub fn handle(&self, event: PlayerEvent) -> PlayerAction {
        let Some(hub) = self.hub.upgrade() else {
            return PlayerAction::Ignore;
        };

        let action = {
            let mut state = self.state.lock();
            let action = transition(&state, event);
            match action {
                PlayerAction::Ignore => {}
                PlayerAction::Rearm(key) => {
                    *self.last_heartbeat.lock() = Instant::now();
                    hub.wheels().kick.rearm(key);
                }
                PlayerAction::Advance { cancel, next } => {
                    if let (Some(key), Some(wheel)) = (cancel, wheel_for(&hub, state.phase())) {
                        wheel.remove(key);
                    }
                    *state = self.enter(&hub, next);
                }
            }
            action
        };

        match action {
            PlayerAction::Ignore => {
                trace!(player_id = %self.id, ?event, "event ignored");
            }
            PlayerAction::Rearm(_) => {}
            PlayerAction::Advance { next, .. } => {
                debug!(player_id = %self.id, ?event, ?next, "player state changed");
                self.on_entered(&hub, next);
            }
        }
        action
    }

    fn enter(&self, hub: &SessionHub, next: PlayerPhase) -> PlayerState {
        match next {
            PlayerPhase::Offline => PlayerState::Offline {
                unload_timer: hub.wheels().unload.insert(Arc::new(PlayerTimeout {
                    player: self.this.clone(),
                })),
            },
            PlayerPhase::Online => PlayerState::Online {
                kick_timer: hub.wheels().kick.insert(Arc::new(KickExpiry {
                    player: self.this.clone(),
                    kick_after: hub.config().kick_after(),
                })),
            },
            PlayerPhase::Binding => PlayerState::Binding,
            PlayerPhase::Kicking => PlayerState::Kicking,
            PlayerPhase::Unloading => PlayerState::Unloading,
        }
    }

    /// Entry effects that must not run under the state lock.
    fn on_entered(&self, hub: &SessionHub, phase: PlayerPhase) {
        match phase {
            PlayerPhase::Online => {
                if let Some(link) = self.link() {
                    link.outbound.notify_bind_success();
                }
            }
            PlayerPhase::Kicking => {
                hub.coordinator().request_kick(self.id);
            }
            PlayerPhase::Unloading => {
                if let Some(this) = self.this.upgrade() {
                    hub.forget_player(&this);
                }
                self.unloaded.send_replace(true);
                info!(player_id = %self.id, "player unloaded");
            }
            PlayerPhase::Offline | PlayerPhase::Binding => {}
        }
    }

    // -----------------------------------------------------------------------
    // Binder
    // -----------------------------------------------------------------------

    /// Hands a bind order to the binder.
    ///
    /// # Errors
    /// [`SessionError::BinderBusy`] if an earlier order is still queued,
    /// [`SessionError::PlayerUnloaded`] if the binder has stopped.
    pub(crate) fn request_bind(
        &self,
        conn: Arc<Connection>,
        created: Instant,
    ) -> Result<(), SessionError> {
        self.dispatch(Order::Bind { conn, created })
    }

    /// Hands a kick order to the binder. Errors as for `request_bind`.
    pub(crate) fn request_unbind(&self, created: Instant) -> Result<(), SessionError> {
        self.dispatch(Order::Unbind { created })
    }

    fn dispatch(&self, order: Order) -> Result<(), SessionError> {
        self.orders.try_send(order).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SessionError::BinderBusy(self.id),
            mpsc::error::TrySendError::Closed(_) => SessionError::PlayerUnloaded(self.id),
        })
    }

    async fn run_binder(
        self: Arc<Self>,
        mut orders: mpsc::Receiver<Order>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut unloaded = self.unloaded.subscribe();
        loop {
            let order = tokio::select! {
                order = orders.recv() => match order {
                    Some(order) => order,
                    None => break,
                },
                _ = unloaded.wait_for(|done| *done) => break,
                _ = shutdown.wait_for(|stop| *stop) => break,
            };
            match order {
                Order::Bind { conn, created } => self.bind(conn, created).await,
                Order::Unbind { created } => self.unbind(created).await,
            }
        }

        orders.close();
        while let Ok(order) = orders.try_recv() {
            if let Order::Bind { conn, .. } = order {
                conn.request_close();
            }
        }
        self.stop_logic();
        debug!(player_id = %self.id, "binder stopped");
    }

    async fn bind(self: &Arc<Self>, conn: Arc<Connection>, created: Instant) {
        let Some(hub) = self.hub.upgrade() else {
            return;
        };
        let deadline = created + hub.config().bind_deadline;

        if matches!(self.handle(PlayerEvent::Bind), PlayerAction::Ignore) {
            debug!(player_id = %self.id, conn_id = %conn.id(), "bind refused in current state");
            conn.request_close();
            return;
        }

        self.stop_logic();
        let old = self.link();
        if let Some(old) = &old {
            evict(&hub, old, CloseReason::SupersededByNewConnection);
        }

        if self.quiesce(old.as_ref(), deadline).await {
            *self.link.lock() = Some(conn.link());
            *self.last_heartbeat.lock() = Instant::now();
            self.handle(PlayerEvent::BindSuccess);
            self.start_logic();
            info!(
                player_id = %self.id,
                conn_id = %conn.id(),
                superseded = ?old.map(|l| l.conn_id),
                "player bound"
            );
        } else {
            warn!(
                player_id = %self.id,
                conn_id = %conn.id(),
                "bind abandoned, previous connection did not quiesce"
            );
            conn.request_close();
            let linked = self.link.lock().is_some();
            self.handle(PlayerEvent::BindAbandoned { linked });
            if linked {
                self.start_logic();
            }
        }
    }

    async fn unbind(&self, created: Instant) {
        let Some(hub) = self.hub.upgrade() else {
            return;
        };
        if self.phase() != PlayerPhase::Kicking {
            debug!(player_id = %self.id, "kick skipped, player no longer kicking");
            return;
        }
        let deadline = created + hub.config().kick_deadline;

        self.stop_logic();
        let old = self.link();
        if let Some(old) = &old {
            evict(&hub, old, CloseReason::HeartbeatTimeout);
        }
        if !self.quiesce(old.as_ref(), deadline).await {
            warn!(player_id = %self.id, "kick deadline passed, detaching anyway");
        }
        *self.link.lock() = None;
        self.handle(PlayerEvent::KickSuccess);
        info!(player_id = %self.id, "player kicked");
    }

    /// Waits until the logic task and both I/O tasks of `old` have exited.
    /// Returns `false` if `deadline` passes first.
    async fn quiesce(&self, old: Option<&Link>, deadline: Instant) -> bool {
        let mut pause = QUIESCE_MIN;
        loop {
            if self.logic_running() == 0 && old.is_none_or(Link::is_quiet) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(pause.min(deadline - now)).await;
            pause = (pause * 2).min(QUIESCE_MAX);
        }
    }

    // -----------------------------------------------------------------------
    // Logic
    // -----------------------------------------------------------------------

    fn start_logic(self: &Arc<Self>) {
        let generation = self.logic_generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.logic_running.fetch_add(1, Ordering::AcqRel);
        let player = Arc::clone(self);
        tokio::spawn(async move {
            player.run_logic(generation).await;
            player.logic_running.fetch_sub(1, Ordering::AcqRel);
        });
    }

    fn stop_logic(&self) {
        self.logic_generation.fetch_add(1, Ordering::AcqRel);
    }

    async fn run_logic(&self, generation: u64) {
        let (Some(hub), Some(link)) = (self.hub.upgrade(), self.link()) else {
            return;
        };
        trace!(player_id = %self.id, generation, "logic started");
        while self.logic_generation.load(Ordering::Acquire) == generation
            && !self.is_unloaded()
            && !hub.shutdown().is_triggered()
        {
            if let Some(msg) = link.inbound.take_message(LOGIC_WAIT).await {
                self.on_message(&msg);
                hub.registry().release(msg);
            }
        }
        trace!(player_id = %self.id, generation, "logic stopped");
    }

    fn on_message(&self, msg: &Message) {
        match msg.protocol_id {
            ProtocolId::CLIENT_HEARTBEAT => {
                self.handle(PlayerEvent::Heartbeat);
            }
            other => {
                debug!(player_id = %self.id, protocol_id = %other, "unhandled message");
            }
        }
    }
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Player")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("link", &self.link().map(|l| l.conn_id))
            .finish()
    }
}

/// Tells the connection behind `link` to go away, with `reason`.
fn evict(hub: &SessionHub, link: &Link, reason: CloseReason) {
    link.inbound.notify_close();
    let msg = hub.registry().acquire(Payload::force_close(reason));
    if let Err(msg) = link.outbound.add_message(msg) {
        hub.registry().release(msg);
    }
    link.outbound.notify_close();
}

fn wheel_for(hub: &SessionHub, phase: PlayerPhase) -> Option<&Arc<TimeoutWheel>> {
    match phase {
        PlayerPhase::Offline => Some(&hub.wheels().unload),
        PlayerPhase::Online => Some(&hub.wheels().kick),
        _ => None,
    }
}

/// Unload timer.
struct PlayerTimeout {
    player: Weak<Player>,
}

impl Expiry for PlayerTimeout {
    fn release(&self, key: TimerKey) {
        if let Some(player) = self.player.upgrade() {
            player.handle(PlayerEvent::Timeout(key));
        }
    }
}

/// Kick timer. Deferred while the last heartbeat is younger than
/// `kick_after`.
struct KickExpiry {
    player: Weak<Player>,
    kick_after: Duration,
}

impl Expiry for KickExpiry {
    fn should_release(&self) -> bool {
        self.player
            .upgrade()
            .is_none_or(|player| player.heartbeat_age() >= self.kick_after)
    }

    fn release(&self, key: TimerKey) {
        if let Some(player) = self.player.upgrade() {
            player.handle(PlayerEvent::Timeout(key));
        }
    }
}
