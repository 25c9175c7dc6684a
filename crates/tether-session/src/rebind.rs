//! Rebind coordinator.
//!
//! Bind and kick requests land in a pending map keyed by player, at most
//! one per player. A single worker drains the map, resolves the live player
//! and connection, and hands each request to that player's binder. Requests
//! older than their deadline are dropped.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tether_protocol::PlayerId;
use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{Connection, PlayerEvent, PlayerPhase, SessionError, SessionHub};

/// Pause between passes while requests are pending.
const BUSY_PASS: Duration = Duration::from_millis(5);
/// Longest idle wait when nothing is pending.
const IDLE_WAIT: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub enum Pending {
    Bind {
        conn: Arc<Connection>,
        created: Instant,
    },
    Kick {
        created: Instant,
    },
}

impl Pending {
    fn created(&self) -> Instant {
        match self {
            Self::Bind { created, .. } | Self::Kick { created } => *created,
        }
    }
}

#[derive(Debug)]
pub struct Coordinator {
    pending: Mutex<HashMap<PlayerId, Pending>>,
    added: Notify,
    bind_deadline: Duration,
    kick_deadline: Duration,
}

impl Coordinator {
    pub fn new(bind_deadline: Duration, kick_deadline: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            added: Notify::new(),
            bind_deadline,
            kick_deadline,
        }
    }

    /// Requests that `conn` become the player's connection. Replaces any
    /// earlier request for the same player.
    pub fn request_bind(&self, uid: PlayerId, conn: Arc<Connection>) {
        let replaced = self.pending.lock().insert(
            uid,
            Pending::Bind {
                conn,
                created: Instant::now(),
            },
        );
        if let Some(Pending::Bind { conn, .. }) = replaced {
            debug!(player_id = %uid, conn_id = %conn.id(), "pending bind replaced");
            conn.request_close();
        }
        self.added.notify_one();
    }

    /// Requests that the player be detached from its connection. A pending
    /// bind already detaches it, so the kick is not queued behind one.
    pub fn request_kick(&self, uid: PlayerId) {
        match self.pending.lock().entry(uid) {
            Entry::Occupied(_) => return,
            Entry::Vacant(slot) => {
                slot.insert(Pending::Kick {
                    created: Instant::now(),
                });
            }
        }
        self.added.notify_one();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_pending(&self, uid: PlayerId) -> bool {
        self.pending.lock().contains_key(&uid)
    }

    fn deadline(&self, req: &Pending) -> Duration {
        match req {
            Pending::Bind { .. } => self.bind_deadline,
            Pending::Kick { .. } => self.kick_deadline,
        }
    }

    /// Worker loop. Runs until shutdown.
    pub(crate) async fn run(
        self: Arc<Self>,
        hub: Weak<SessionHub>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("rebind coordinator started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let Some(strong) = hub.upgrade() else {
                break;
            };
            let wait = if self.pending_len() > 0 {
                self.pass(&strong);
                BUSY_PASS
            } else {
                IDLE_WAIT
            };
            drop(strong);

            tokio::select! {
                _ = self.added.notified(), if wait == IDLE_WAIT => {}
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("rebind coordinator stopped");
    }

    /// Puts undispatched requests back. A bind that arrived during the pass
    /// is newer and keeps its slot; the requeued bind it displaces is closed.
    /// A requeued bind still takes the slot from a kick.
    fn requeue(&self, requests: Vec<(PlayerId, Pending)>) {
        if requests.is_empty() {
            return;
        }
        let mut displaced = Vec::new();
        {
            let mut pending = self.pending.lock();
            for (uid, req) in requests {
                match pending.entry(uid) {
                    Entry::Vacant(slot) => {
                        slot.insert(req);
                    }
                    Entry::Occupied(mut slot) => {
                        let kick_queued = matches!(slot.get(), Pending::Kick { .. });
                        match req {
                            Pending::Bind { .. } if kick_queued => {
                                slot.insert(req);
                            }
                            Pending::Bind { conn, .. } => displaced.push(conn),
                            Pending::Kick { .. } => {}
                        }
                    }
                }
            }
        }
        for conn in displaced {
            debug!(conn_id = %conn.id(), "requeued bind displaced by a newer one");
            conn.request_close();
        }
    }

    /// Processes every pending request once.
    pub(crate) fn pass(&self, hub: &Arc<SessionHub>) {
        let drained: Vec<(PlayerId, Pending)> = self.pending.lock().drain().collect();
        if drained.is_empty() {
            return;
        }

        let now = Instant::now();
        let mut requeue = Vec::new();
        let mut dropped_binds = Vec::new();
        let mut abandoned_kicks = Vec::new();

        for (uid, req) in drained {
            let stale = now.duration_since(req.created()) > self.deadline(&req);
            match req {
                Pending::Bind { conn, created } => {
                    let (player, live_conn) = hub.lookup(uid, conn.id());
                    if stale {
                        debug!(player_id = %uid, conn_id = %conn.id(), "stale bind dropped");
                        dropped_binds.push((uid, conn, player));
                        continue;
                    }
                    if live_conn.is_none() {
                        debug!(player_id = %uid, conn_id = %conn.id(), "bind requester gone");
                        dropped_binds.push((uid, conn, player));
                        continue;
                    }
                    // Unloaded after the auth reply went out: load it again.
                    let player = match player.filter(|p| !p.is_unloaded()) {
                        Some(player) => player,
                        None => {
                            debug!(player_id = %uid, "player reloaded for pending bind");
                            hub.load_player(uid)
                        }
                    };
                    match player.request_bind(Arc::clone(&conn), created) {
                        Ok(()) => {
                            debug!(player_id = %uid, conn_id = %conn.id(), "bind dispatched");
                        }
                        Err(SessionError::BinderBusy(_) | SessionError::PlayerUnloaded(_)) => {
                            requeue.push((uid, Pending::Bind { conn, created }));
                        }
                        Err(e) => {
                            debug!(player_id = %uid, error = %e, "bind not dispatched");
                            dropped_binds.push((uid, conn, Some(player)));
                        }
                    }
                }
                Pending::Kick { created } => {
                    let Some(player) = hub.player(uid) else {
                        continue;
                    };
                    if stale {
                        warn!(player_id = %uid, "stale kick dropped");
                        abandoned_kicks.push(player);
                        continue;
                    }
                    match player.request_unbind(created) {
                        Ok(()) => debug!(player_id = %uid, "kick dispatched"),
                        Err(SessionError::BinderBusy(_)) => {
                            requeue.push((uid, Pending::Kick { created }));
                        }
                        Err(e) => debug!(player_id = %uid, error = %e, "kick not dispatched"),
                    }
                }
            }
        }

        self.requeue(requeue);
        for (uid, conn, player) in dropped_binds {
            conn.request_close();
            if player.is_some_and(|p| p.phase() == PlayerPhase::Kicking) {
                self.request_kick(uid);
            }
        }
        for player in abandoned_kicks {
            player.handle(PlayerEvent::KickAbandoned);
        }
    }
}
