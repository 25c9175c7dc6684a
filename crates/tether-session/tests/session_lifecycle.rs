//! End-to-end tests for the session layer without sockets.
//!
//! A pair of fake I/O tasks stands in for each connection's read and write
//! loops: the reader parks until asked to close, the writer records what the
//! server queued. Time is paused, so every timeout below is virtual.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tether_protocol::{
    ClientAuth, ClientHeartbeat, CloseReason, JsonRegistry, Message, Payload, PayloadRegistry,
    PlayerId,
};
use tether_session::{
    ConnEvent, ConnPhase, Connection, PlayerPhase, SessionConfig, SessionHub, Shutdown,
    WheelBuckets,
};
use tether_transport::ConnectionId;
use tokio::task::JoinHandle;

// =========================================================================
// Helpers
// =========================================================================

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

fn config() -> SessionConfig {
    SessionConfig {
        auth_wait: ms(200),
        bind_wait: ms(1000),
        idle_wait: ms(1000),
        heartbeat_interval: ms(100),
        kick_after: Some(ms(300)),
        unload_after: ms(500),
        bind_deadline: ms(200),
        kick_deadline: ms(200),
        token_lifetime: ms(1000),
        buckets: WheelBuckets {
            auth: 10,
            bind: 10,
            idle: 10,
            kick: 10,
            unload: 10,
            token: 10,
        },
        ..SessionConfig::default()
    }
}

struct Harness {
    hub: Arc<SessionHub>,
    registry: Arc<JsonRegistry>,
    shutdown: Shutdown,
}

impl Harness {
    fn new(config: SessionConfig) -> Self {
        let h = Self::unstarted(config);
        h.hub.start();
        h
    }

    /// No wheel drivers and no coordinator worker until `hub.start()`.
    fn unstarted(config: SessionConfig) -> Self {
        let registry = Arc::new(JsonRegistry::new());
        let shutdown = Shutdown::new();
        let hub = SessionHub::new(
            config,
            Arc::clone(&registry) as Arc<dyn PayloadRegistry>,
            shutdown.clone(),
        )
        .unwrap();
        Self {
            hub,
            registry,
            shutdown,
        }
    }

    fn connect(&self) -> FakeClient {
        let conn = self.hub.open_connection(ConnectionId::next());
        FakeClient::spawn(conn, Arc::clone(&self.registry))
    }

    fn auth(&self, client: &FakeClient, uid: u64) {
        let token = self.hub.issue_token(PlayerId(uid));
        self.hub.handle_client_auth(
            &client.conn,
            &ClientAuth {
                uid: PlayerId(uid),
                token,
            },
        );
    }

    fn auth_with(&self, conn: &Arc<Connection>, uid: u64, token: &str) {
        self.hub.handle_client_auth(
            conn,
            &ClientAuth {
                uid: PlayerId(uid),
                token: token.into(),
            },
        );
    }

    fn heartbeat(&self, client: &FakeClient) {
        let msg = self
            .registry
            .acquire(Payload::ClientHeartbeat(ClientHeartbeat {}));
        client.conn.deliver(msg);
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

/// Fake read and write loops around one connection.
struct FakeClient {
    conn: Arc<Connection>,
    written: Arc<Mutex<Vec<Payload>>>,
    _tasks: [JoinHandle<()>; 2],
}

impl FakeClient {
    fn spawn(conn: Arc<Connection>, registry: Arc<JsonRegistry>) -> Self {
        let written = Arc::new(Mutex::new(Vec::new()));

        let reader = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                while !conn.inbound().should_close() {
                    tokio::time::sleep(ms(5)).await;
                }
                conn.inbound().notify_client_read_closed();
                conn.half_finished();
            })
        };

        let writer = {
            let conn = Arc::clone(&conn);
            let written = Arc::clone(&written);
            tokio::spawn(async move {
                let out = Arc::clone(conn.outbound());
                let record = |msg: Message| {
                    written.lock().push(msg.payload.clone());
                    registry.release(msg);
                };
                let mut bound = false;
                loop {
                    if !bound && out.is_bind_success() {
                        bound = true;
                        conn.handle(ConnEvent::BindSuccess);
                    }
                    if out.should_close() {
                        while let Some(msg) = out.try_take_message() {
                            record(msg);
                        }
                        break;
                    }
                    if let Some(msg) = out.take_message(ms(5)).await {
                        record(msg);
                    }
                }
                out.notify_client_write_closed();
                conn.half_finished();
            })
        };

        Self {
            conn,
            written,
            _tasks: [reader, writer],
        }
    }

    fn written(&self) -> Vec<Payload> {
        self.written.lock().clone()
    }

    fn is_reclaimed(&self) -> bool {
        self.conn.halves_running() == 0
    }
}

async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..2_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(ms(5)).await;
    }
    panic!("timed out waiting for {what}");
}

// =========================================================================
// Auth
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_auth_valid_token_binds_player() {
    let h = Harness::new(config());
    let client = h.connect();
    h.auth(&client, 7);

    eventually("bound", || client.conn.phase() == ConnPhase::Bound).await;
    let player = h.hub.player(PlayerId(7)).unwrap();
    assert!(player.is_online());
    assert_eq!(player.link().unwrap().conn_id, client.conn.id());
    assert_eq!(client.conn.player_id(), Some(PlayerId(7)));
    assert_eq!(client.written(), vec![Payload::auth_result(true)]);
    assert!(h.hub.tokens().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_auth_timeout_closes_connection() {
    let h = Harness::new(config());
    let client = h.connect();
    assert_eq!(h.hub.connection_count(), 1);

    tokio::time::sleep(ms(150)).await;
    assert!(!client.conn.is_close_requested());

    eventually("reclaimed", || client.is_reclaimed()).await;
    assert_eq!(client.conn.phase(), ConnPhase::Closed);
    assert_eq!(h.hub.connection_count(), 0);
    assert!(client.written().is_empty());
    assert!(h.hub.wheels().auth.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_auth_without_token_closes_silently() {
    let h = Harness::new(config());
    let client = h.connect();
    h.hub.handle_client_auth(
        &client.conn,
        &ClientAuth {
            uid: PlayerId(1),
            token: "never-issued".into(),
        },
    );

    eventually("reclaimed", || client.is_reclaimed()).await;
    assert!(client.written().is_empty());
    assert!(h.hub.player(PlayerId(1)).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_auth_bad_token_replies_false_then_closes() {
    let h = Harness::new(config());
    let client = h.connect();
    h.hub.issue_token(PlayerId(1));
    h.hub.handle_client_auth(
        &client.conn,
        &ClientAuth {
            uid: PlayerId(1),
            token: "wrong".into(),
        },
    );

    eventually("reclaimed", || client.is_reclaimed()).await;
    assert_eq!(client.written(), vec![Payload::auth_result(false)]);
    assert_eq!(h.hub.tokens().len(), 1);
    assert!(h.hub.player(PlayerId(1)).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_auth_wrong_guess_keeps_owner_token() {
    let h = Harness::new(config());
    let token = h.hub.issue_token(PlayerId(1));

    let stranger = h.connect();
    h.auth_with(&stranger.conn, 1, "guess");
    eventually("stranger reclaimed", || stranger.is_reclaimed()).await;
    assert_eq!(stranger.written(), vec![Payload::auth_result(false)]);

    let owner = h.connect();
    h.auth_with(&owner.conn, 1, &token);
    eventually("owner bound", || owner.conn.phase() == ConnPhase::Bound).await;
    assert_eq!(owner.written(), vec![Payload::auth_result(true)]);
    assert!(h.hub.tokens().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_second_auth_on_same_connection_closes_it() {
    let h = Harness::new(config());
    let client = h.connect();
    h.auth(&client, 3);
    eventually("bound", || client.conn.phase() == ConnPhase::Bound).await;

    h.auth(&client, 3);
    eventually("reclaimed", || client.is_reclaimed()).await;
    // The token issued for the repeat attempt is still redeemable.
    assert_eq!(h.hub.tokens().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_repeat_auth_on_bound_connection_leaves_fresh_token() {
    let h = Harness::new(config());
    let first = h.connect();
    h.auth(&first, 3);
    eventually("first bound", || first.conn.phase() == ConnPhase::Bound).await;

    let fresh = h.hub.issue_token(PlayerId(3));
    h.auth_with(&first.conn, 3, "stale");
    eventually("first reclaimed", || first.is_reclaimed()).await;

    let second = h.connect();
    h.auth_with(&second.conn, 3, &fresh);
    eventually("second bound", || second.conn.phase() == ConnPhase::Bound).await;
    let player = h.hub.player(PlayerId(3)).unwrap();
    assert_eq!(player.link().unwrap().conn_id, second.conn.id());
    assert_eq!(first.written(), vec![Payload::auth_result(true)]);
    assert_eq!(second.written(), vec![Payload::auth_result(true)]);
}

// =========================================================================
// Connection reclamation
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_half_finished_second_call_reclaims_once() {
    let h = Harness::new(config());
    let conn = h.hub.open_connection(ConnectionId::next());

    assert!(!conn.half_finished());
    assert_eq!(h.hub.connection_count(), 1);
    assert!(conn.half_finished());
    assert_eq!(h.hub.connection_count(), 0);
    assert_eq!(conn.phase(), ConnPhase::Closed);
    assert!(h.hub.wheels().auth.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_half_finished_releases_queued_messages() {
    let h = Harness::new(config());
    let conn = h.hub.open_connection(ConnectionId::next());
    assert!(conn.send(Payload::auth_result(true)));
    assert_eq!(h.registry.outstanding(), 1);

    conn.half_finished();
    conn.half_finished();
    assert_eq!(h.registry.outstanding(), 0);
}

// =========================================================================
// Rebind
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_rebind_supersedes_old_connection() {
    let h = Harness::new(config());
    let first = h.connect();
    h.auth(&first, 42);
    eventually("first bound", || first.conn.phase() == ConnPhase::Bound).await;

    let second = h.connect();
    h.auth(&second, 42);
    eventually("second bound", || second.conn.phase() == ConnPhase::Bound).await;

    let player = h.hub.player(PlayerId(42)).unwrap();
    assert_eq!(player.link().unwrap().conn_id, second.conn.id());
    assert!(player.is_online());

    eventually("first reclaimed", || first.is_reclaimed()).await;
    assert_eq!(
        first.written(),
        vec![
            Payload::auth_result(true),
            Payload::force_close(CloseReason::SupersededByNewConnection),
        ]
    );
    assert_eq!(second.written(), vec![Payload::auth_result(true)]);
    assert_eq!(h.hub.connection_count(), 1);
    eventually("leases returned", || h.registry.outstanding() == 0).await;
}

#[tokio::test(start_paused = true)]
async fn test_rapid_reconnects_attach_exactly_one() {
    let h = Harness::new(config());
    let mut clients = Vec::new();
    for i in 0..6 {
        let client = h.connect();
        h.auth(&client, 9);
        clients.push(client);
        if i % 2 == 0 {
            tokio::task::yield_now().await;
        }
    }

    eventually("one connection left", || h.hub.connection_count() == 1).await;
    let player = h.hub.player(PlayerId(9)).unwrap();
    eventually("player online", || player.is_online()).await;

    let link = player.link().unwrap();
    let alive: Vec<_> = clients.iter().filter(|c| !c.is_reclaimed()).collect();
    assert_eq!(alive.len(), 1);
    assert_eq!(alive[0].conn.id(), link.conn_id);
    assert_eq!(alive[0].conn.phase(), ConnPhase::Bound);
    assert_eq!(h.hub.player_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_bind_abandoned_when_old_connection_never_quiesces() {
    let h = Harness::new(SessionConfig {
        kick_after: Some(ms(5000)),
        ..config()
    });
    // No I/O tasks: this connection never goes quiet.
    let stuck = h.hub.open_connection(ConnectionId::next());
    let token = h.hub.issue_token(PlayerId(21));
    h.auth_with(&stuck, 21, &token);
    let player = h.hub.player(PlayerId(21)).unwrap();
    eventually("stuck bound", || player.link().is_some_and(|l| l.conn_id == stuck.id())).await;

    let late = h.connect();
    h.auth(&late, 21);
    eventually("late reclaimed", || late.is_reclaimed()).await;
    assert_eq!(late.written(), vec![Payload::auth_result(true)]);
    assert!(stuck.outbound().should_close());

    // Online on the link that was told to close, until the kick detaches it.
    assert!(player.is_online());
    assert_eq!(player.link().unwrap().conn_id, stuck.id());
    eventually("kicked", || player.phase() == PlayerPhase::Offline).await;
    assert!(player.link().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_stale_bind_dropped_and_requester_closed() {
    let h = Harness::unstarted(config());
    let client = h.connect();
    h.auth(&client, 22);
    assert!(h.hub.coordinator().is_pending(PlayerId(22)));

    tokio::time::sleep(ms(300)).await;
    h.hub.start();

    eventually("reclaimed", || client.is_reclaimed()).await;
    assert_eq!(client.written(), vec![Payload::auth_result(true)]);
    assert!(!h.hub.coordinator().is_pending(PlayerId(22)));
    assert!(
        h.hub
            .player(PlayerId(22))
            .is_none_or(|p| !p.is_online() && p.link().is_none())
    );
}

#[tokio::test(start_paused = true)]
async fn test_pending_bind_last_request_wins() {
    let h = Harness::unstarted(config());
    let first = h.connect();
    h.auth(&first, 23);
    let second = h.connect();
    h.auth(&second, 23);

    assert_eq!(h.hub.coordinator().pending_len(), 1);
    eventually("first reclaimed", || first.is_reclaimed()).await;
    assert_eq!(first.written(), vec![Payload::auth_result(true)]);

    h.hub.start();
    eventually("second bound", || second.conn.phase() == ConnPhase::Bound).await;
    let player = h.hub.player(PlayerId(23)).unwrap();
    assert_eq!(player.link().unwrap().conn_id, second.conn.id());
}

#[tokio::test(start_paused = true)]
async fn test_kick_request_does_not_displace_pending_bind() {
    let h = Harness::unstarted(config());
    let client = h.connect();
    h.auth(&client, 24);
    h.hub.coordinator().request_kick(PlayerId(24));
    assert_eq!(h.hub.coordinator().pending_len(), 1);

    h.hub.start();
    eventually("bound", || client.conn.phase() == ConnPhase::Bound).await;
    assert!(h.hub.player(PlayerId(24)).unwrap().is_online());
}

#[tokio::test(start_paused = true)]
async fn test_player_unloaded_before_bind_is_reloaded() {
    let h = Harness::unstarted(config());
    let client = h.connect();
    h.auth(&client, 25);
    let old = h.hub.player(PlayerId(25)).unwrap();
    assert!(h.hub.unload_player(PlayerId(25)));
    assert!(old.is_unloaded());

    h.hub.start();
    eventually("bound", || client.conn.phase() == ConnPhase::Bound).await;
    let player = h.hub.player(PlayerId(25)).unwrap();
    assert!(!Arc::ptr_eq(&old, &player));
    assert!(player.is_online());
    assert_eq!(client.written(), vec![Payload::auth_result(true)]);
}

// =========================================================================
// Heartbeat, kick, idle, unload
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_heartbeat_rearm_never_kicks() {
    let h = Harness::new(config());
    let client = h.connect();
    h.auth(&client, 5);
    eventually("bound", || client.conn.phase() == ConnPhase::Bound).await;
    let player = h.hub.player(PlayerId(5)).unwrap();

    // Ten kick windows worth of heartbeats.
    for _ in 0..60 {
        h.heartbeat(&client);
        tokio::time::sleep(ms(50)).await;
        assert!(player.is_online(), "kicked while heartbeating");
    }
    assert!(!client.conn.is_close_requested());
    assert_eq!(h.hub.wheels().kick.stats().fired, 0);
}

#[tokio::test(start_paused = true)]
async fn test_missing_heartbeat_kicks_then_unloads() {
    let h = Harness::new(config());
    let client = h.connect();
    h.auth(&client, 5);
    eventually("bound", || client.conn.phase() == ConnPhase::Bound).await;
    let player = h.hub.player(PlayerId(5)).unwrap();

    eventually("kicked", || player.phase() == PlayerPhase::Offline).await;
    assert!(player.link().is_none());
    eventually("reclaimed", || client.is_reclaimed()).await;
    assert_eq!(
        client.written(),
        vec![
            Payload::auth_result(true),
            Payload::force_close(CloseReason::HeartbeatTimeout),
        ]
    );

    tokio::time::timeout(ms(2000), player.unloaded())
        .await
        .expect("player must unload");
    assert_eq!(player.phase(), PlayerPhase::Unloading);
    assert!(h.hub.player(PlayerId(5)).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_idle_close_without_kick() {
    let h = Harness::new(SessionConfig {
        idle_wait: ms(200),
        kick_after: Some(ms(5000)),
        ..config()
    });
    let client = h.connect();
    h.auth(&client, 11);
    eventually("bound", || client.conn.phase() == ConnPhase::Bound).await;

    eventually("idle close", || client.is_reclaimed()).await;
    let player = h.hub.player(PlayerId(11)).unwrap();
    assert!(player.is_online(), "idle close must not kick");
    assert!(player.link().unwrap().is_quiet());
    assert_eq!(client.written(), vec![Payload::auth_result(true)]);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_after_idle_close_rebinds() {
    let h = Harness::new(SessionConfig {
        idle_wait: ms(200),
        kick_after: Some(ms(5000)),
        ..config()
    });
    let first = h.connect();
    h.auth(&first, 11);
    eventually("first reclaimed", || first.is_reclaimed()).await;

    let second = h.connect();
    h.auth(&second, 11);
    eventually("second bound", || second.conn.phase() == ConnPhase::Bound).await;
    let player = h.hub.player(PlayerId(11)).unwrap();
    assert_eq!(player.link().unwrap().conn_id, second.conn.id());
}

#[tokio::test(start_paused = true)]
async fn test_unload_player_only_when_offline() {
    let h = Harness::new(config());
    let client = h.connect();
    h.auth(&client, 8);
    eventually("bound", || client.conn.phase() == ConnPhase::Bound).await;

    assert!(!h.hub.unload_player(PlayerId(8)));
    assert!(h.hub.kick_player(PlayerId(8)));
    let player = h.hub.player(PlayerId(8)).unwrap();
    eventually("offline", || player.phase() == PlayerPhase::Offline).await;

    assert!(h.hub.unload_player(PlayerId(8)));
    assert!(player.is_unloaded());
    assert_eq!(h.hub.player_count(), 0);
    assert!(!h.hub.unload_player(PlayerId(8)));
}
