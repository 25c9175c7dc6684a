//! The session hub: owner of every table, wheel and background task of the
//! session layer.
//!
//! # Lock order
//!
//! ```text
//! players ──▶ connections          (lookup)
//! connection / player state ──▶ wheel
//! wheel ──▶ last heartbeat         (kick deferral check)
//! ```
//!
//! Nothing that holds a table lock takes a state lock, and nothing holds a
//! lock across an await.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tether_protocol::{ClientAuth, Payload, PayloadRegistry, PlayerId};
use tether_transport::ConnectionId;
use tether_wheel::{TimeoutWheel, WheelError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    ConnAction, ConnEvent, Connection, Coordinator, Player, PlayerAction, PlayerEvent,
    SessionConfig, SessionError, Shutdown, TokenStore,
};

/// One wheel per timer class.
#[derive(Debug)]
pub struct Wheels {
    pub auth: Arc<TimeoutWheel>,
    pub bind: Arc<TimeoutWheel>,
    pub idle: Arc<TimeoutWheel>,
    pub kick: Arc<TimeoutWheel>,
    pub unload: Arc<TimeoutWheel>,
    pub token: Arc<TimeoutWheel>,
}

impl Wheels {
    pub fn new(config: &SessionConfig) -> Result<Self, WheelError> {
        let wheel = |c| TimeoutWheel::new(c).map(Arc::new);
        Ok(Self {
            auth: wheel(config.auth_wheel())?,
            bind: wheel(config.bind_wheel())?,
            idle: wheel(config.idle_wheel())?,
            kick: wheel(config.kick_wheel())?,
            unload: wheel(config.unload_wheel())?,
            token: wheel(config.token_wheel())?,
        })
    }

    pub fn all(&self) -> [&Arc<TimeoutWheel>; 6] {
        [
            &self.auth,
            &self.bind,
            &self.idle,
            &self.kick,
            &self.unload,
            &self.token,
        ]
    }
}

pub struct SessionHub {
    config: SessionConfig,
    registry: Arc<dyn PayloadRegistry>,
    wheels: Wheels,
    tokens: Arc<TokenStore>,
    coordinator: Arc<Coordinator>,
    /// Identity table.
    players: Mutex<HashMap<PlayerId, Arc<Player>>>,
    /// Connection set.
    connections: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
    shutdown: Shutdown,
    started: AtomicBool,
}

impl SessionHub {
    /// Builds the hub and its wheels. Nothing runs until [`start`](Self::start).
    ///
    /// # Errors
    /// [`SessionError::Wheel`] if a timeout/bucket pair yields a tick below
    /// one millisecond.
    pub fn new(
        config: SessionConfig,
        registry: Arc<dyn PayloadRegistry>,
        shutdown: Shutdown,
    ) -> Result<Arc<Self>, SessionError> {
        let wheels = Wheels::new(&config)?;
        let tokens = TokenStore::new(Arc::clone(&wheels.token));
        let coordinator = Arc::new(Coordinator::new(
            config.bind_deadline,
            config.kick_deadline,
        ));
        Ok(Arc::new(Self {
            config,
            registry,
            wheels,
            tokens,
            coordinator,
            players: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            shutdown,
            started: AtomicBool::new(false),
        }))
    }

    /// Spawns the wheel drivers and the coordinator worker. Later calls do
    /// nothing and return no handles.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }
        let mut tasks: Vec<JoinHandle<()>> = self
            .wheels
            .all()
            .into_iter()
            .map(|wheel| tokio::spawn(Arc::clone(wheel).run(self.shutdown.subscribe())))
            .collect();
        tasks.push(tokio::spawn(
            Arc::clone(&self.coordinator).run(Arc::downgrade(self), self.shutdown.subscribe()),
        ));
        info!(wheels = tasks.len() - 1, "session hub started");
        tasks
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<dyn PayloadRegistry> {
        &self.registry
    }

    pub fn wheels(&self) -> &Wheels {
        &self.wheels
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    // -----------------------------------------------------------------------
    // Connections
    // -----------------------------------------------------------------------

    /// Creates a connection in `NotAuthenticated` and registers it.
    pub fn open_connection(self: &Arc<Self>, id: ConnectionId) -> Arc<Connection> {
        let conn = Connection::new(self, id);
        self.connections.lock().insert(id, Arc::clone(&conn));
        debug!(conn_id = %id, "connection opened");
        conn
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.lock().get(&id).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub(crate) fn forget_connection(&self, id: ConnectionId) {
        self.connections.lock().remove(&id);
    }

    // -----------------------------------------------------------------------
    // Players
    // -----------------------------------------------------------------------

    pub fn player(&self, uid: PlayerId) -> Option<Arc<Player>> {
        self.players.lock().get(&uid).cloned()
    }

    pub fn player_count(&self) -> usize {
        self.players.lock().len()
    }

    /// Returns the loaded player for `uid`, loading it if absent or if the
    /// stored entry is already unloaded.
    pub(crate) fn load_player(self: &Arc<Self>, uid: PlayerId) -> Arc<Player> {
        let mut players = self.players.lock();
        if let Some(player) = players.get(&uid).filter(|p| !p.is_unloaded()) {
            return Arc::clone(player);
        }
        let player = Player::spawn(self, uid);
        players.insert(uid, Arc::clone(&player));
        player
    }

    /// Removes `player` from the identity table, unless a newer player for
    /// the same identity has taken its slot.
    pub(crate) fn forget_player(&self, player: &Arc<Player>) {
        let mut players = self.players.lock();
        if players
            .get(&player.id())
            .is_some_and(|current| Arc::ptr_eq(current, player))
        {
            players.remove(&player.id());
        }
    }

    /// Resolves a player and a connection together, identity table first.
    pub(crate) fn lookup(
        &self,
        uid: PlayerId,
        conn_id: ConnectionId,
    ) -> (Option<Arc<Player>>, Option<Arc<Connection>>) {
        let players = self.players.lock();
        let connections = self.connections.lock();
        (
            players.get(&uid).cloned(),
            connections.get(&conn_id).cloned(),
        )
    }

    /// Unloads an offline player now instead of waiting for its unload
    /// timer. Returns `false` if the player is unknown or not offline.
    pub fn unload_player(&self, uid: PlayerId) -> bool {
        self.player(uid)
            .is_some_and(|p| matches!(p.handle(PlayerEvent::Unload), PlayerAction::Advance { .. }))
    }

    /// Kicks an online player now. Returns `false` if the player is unknown
    /// or not online.
    pub fn kick_player(&self, uid: PlayerId) -> bool {
        self.player(uid)
            .is_some_and(|p| matches!(p.handle(PlayerEvent::Kick), PlayerAction::Advance { .. }))
    }

    // -----------------------------------------------------------------------
    // Auth
    // -----------------------------------------------------------------------

    pub fn issue_token(&self, uid: PlayerId) -> String {
        self.tokens.issue(uid)
    }

    /// Handles a `ClientAuth` read on `conn`.
    ///
    /// A connection past `NotAuthenticated` is closed and the token store is
    /// not touched. No token on record: the connection is closed without a
    /// reply. A match consumes the token, replies `passed: true` and
    /// requests a bind. A mismatch replies `passed: false` and closes only
    /// this connection once the reply is flushed; the issued token stays.
    pub fn handle_client_auth(self: &Arc<Self>, conn: &Arc<Connection>, auth: &ClientAuth) {
        let uid = auth.uid;
        if !matches!(conn.handle(ConnEvent::Auth), ConnAction::Advance { .. }) {
            return;
        }

        let passed = match self.tokens.consume(uid, &auth.token) {
            Ok(passed) => passed,
            Err(e) => {
                debug!(conn_id = %conn.id(), player_id = %uid, error = %e, "auth rejected");
                conn.request_close();
                return;
            }
        };

        if passed {
            conn.claim(uid);
            conn.send(Payload::auth_result(true));
            self.load_player(uid);
            self.coordinator.request_bind(uid, Arc::clone(conn));
            debug!(conn_id = %conn.id(), player_id = %uid, "auth passed");
        } else {
            warn!(conn_id = %conn.id(), player_id = %uid, "auth token mismatch");
            conn.inbound().notify_close();
            conn.send(Payload::auth_result(false));
            conn.outbound().notify_close();
        }
    }
}

impl std::fmt::Debug for SessionHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHub")
            .field("players", &self.player_count())
            .field("connections", &self.connection_count())
            .field("pending", &self.coordinator.pending_len())
            .field("tokens", &self.tokens.len())
            .finish_non_exhaustive()
    }
}
