//! `TetherServer` builder and accept loops.
//!
//! This is the entry point for running a Tether server. It ties together
//! the layers: transport → protocol → session.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tether_protocol::{FrameCodec, JsonRegistry, PayloadRegistry, PlayerId};
use tether_session::{SessionConfig, SessionHub, Shutdown};
use tether_transport::{TcpTransport, Transport, TransportError, WebSocketTransport};
use tracing::{debug, error, info, warn};

use crate::handler::{ConnContext, spawn_connection};
use crate::{ServerConfig, TetherError};

/// Pause after refusing a socket over the connection limit.
const REFUSE_PAUSE: Duration = Duration::from_millis(50);
/// Pause after a failed `accept`, so a persistent error does not spin.
const ACCEPT_RETRY: Duration = Duration::from_millis(100);

/// Builder for configuring and starting a Tether server.
///
/// # Example
///
/// ```rust,ignore
/// let server = TetherServer::builder()
///     .tcp("0.0.0.0:59632")
///     .ws("0.0.0.0:8080")
///     .build()
///     .await?;
/// server.run().await
/// ```
pub struct TetherServerBuilder {
    config: ServerConfig,
    registry: Option<Arc<dyn PayloadRegistry>>,
}

impl TetherServerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            registry: None,
        }
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the TCP listen address.
    pub fn tcp(mut self, addr: &str) -> Self {
        self.config.tcp_addr = Some(addr.to_string());
        self
    }

    /// Disables the TCP listener.
    pub fn no_tcp(mut self) -> Self {
        self.config.tcp_addr = None;
        self
    }

    /// Sets the WebSocket listen address.
    pub fn ws(mut self, addr: &str) -> Self {
        self.config.ws_addr = Some(addr.to_string());
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    pub fn max_frame_len(mut self, max: usize) -> Self {
        self.config.max_frame_len = max;
        self
    }

    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.config.ping_interval = interval;
        self
    }

    /// Sets the session configuration.
    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.config.session = config;
        self
    }

    /// Uses `registry` instead of a fresh [`JsonRegistry`].
    pub fn registry(mut self, registry: Arc<dyn PayloadRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Binds the configured listeners and builds the session hub.
    ///
    /// # Errors
    /// [`TetherError::NoListener`] if no address is set, a transport error
    /// if a bind fails, a session error if the timer configuration is
    /// invalid.
    pub async fn build(self) -> Result<TetherServer, TetherError> {
        let config = self.config;
        let tcp_addr = config.tcp_addr.as_deref().filter(|a| !a.is_empty());
        let ws_addr = config.ws_addr.as_deref().filter(|a| !a.is_empty());
        if tcp_addr.is_none() && ws_addr.is_none() {
            return Err(TetherError::NoListener);
        }

        let tcp = match tcp_addr {
            Some(addr) => Some(TcpTransport::bind(addr).await?),
            None => None,
        };
        let ws = match ws_addr {
            Some(addr) => Some(WebSocketTransport::bind(addr).await?),
            None => None,
        };

        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(JsonRegistry::new()));
        let shutdown = Shutdown::new();
        let hub = SessionHub::new(
            config.session.clone(),
            Arc::clone(&registry),
            shutdown.clone(),
        )?;
        let ctx = Arc::new(ConnContext {
            hub: Arc::clone(&hub),
            codec: FrameCodec::new(registry).with_max_frame_len(config.max_frame_len),
            shutdown: shutdown.clone(),
            ping_interval: config.ping_interval,
        });

        Ok(TetherServer {
            tcp,
            ws,
            hub,
            shutdown,
            ctx,
            max_connections: config.max_connections,
        })
    }
}

impl Default for TetherServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A bound, not yet running Tether server.
///
/// Call [`run()`](Self::run) to start accepting connections.
pub struct TetherServer {
    tcp: Option<TcpTransport>,
    ws: Option<WebSocketTransport>,
    hub: Arc<SessionHub>,
    shutdown: Shutdown,
    ctx: Arc<ConnContext>,
    max_connections: usize,
}

impl std::fmt::Debug for TetherServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TetherServer")
            .field("tcp_addr", &self.tcp_addr())
            .field("ws_addr", &self.ws_addr())
            .field("max_connections", &self.max_connections)
            .finish_non_exhaustive()
    }
}

impl TetherServer {
    /// Creates a new builder.
    pub fn builder() -> TetherServerBuilder {
        TetherServerBuilder::new()
    }

    /// The bound TCP address, if the TCP listener is enabled.
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp.as_ref().and_then(|t| t.local_addr().ok())
    }

    /// The bound WebSocket address, if the WebSocket listener is enabled.
    pub fn ws_addr(&self) -> Option<SocketAddr> {
        self.ws.as_ref().and_then(|t| t.local_addr().ok())
    }

    pub fn hub(&self) -> &Arc<SessionHub> {
        &self.hub
    }

    /// A handle that stops the server when triggered.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Issues an auth token for `uid`, as a login service would.
    pub fn issue_token(&self, uid: PlayerId) -> String {
        self.hub.issue_token(uid)
    }

    /// Runs until the shutdown handle is triggered, then drains.
    ///
    /// Draining stops both accept loops, lets every connection flush a
    /// `ServerForceClose{ServerShuttingDown}` within the flush deadline and
    /// waits for the session tasks to stop.
    pub async fn run(self) -> Result<(), TetherError> {
        let hub_tasks = self.hub.start();

        let mut accept_tasks = Vec::new();
        if let Some(tcp) = self.tcp {
            accept_tasks.push(tokio::spawn(accept_loop(
                tcp,
                Arc::clone(&self.ctx),
                self.max_connections,
            )));
        }
        if let Some(ws) = self.ws {
            accept_tasks.push(tokio::spawn(accept_loop(
                ws,
                Arc::clone(&self.ctx),
                self.max_connections,
            )));
        }
        info!(listeners = accept_tasks.len(), "tether server running");

        self.shutdown.triggered().await;
        info!("shutting down");

        for task in accept_tasks {
            let _ = task.await;
        }

        let config = self.hub.config();
        let drain = config.flush_deadline + config.read_poll * 2;
        let drained = tokio::time::timeout(drain, async {
            while self.hub.connection_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                connections = self.hub.connection_count(),
                "connections still open after drain"
            );
        }

        for task in hub_tasks {
            let _ = task.await;
        }
        info!("tether server stopped");
        Ok(())
    }
}

async fn accept_loop<T>(mut transport: T, ctx: Arc<ConnContext>, max_connections: usize)
where
    T: Transport,
{
    let kind = transport.kind();
    let mut shutdown = ctx.shutdown.subscribe();

    loop {
        let accepted = tokio::select! {
            accepted = transport.accept() => accepted,
            _ = shutdown.wait_for(|stop| *stop) => break,
        };

        match accepted {
            Ok(accepted) => {
                if ctx.hub.connection_count() >= max_connections {
                    warn!(
                        transport = kind,
                        peer = %accepted.peer,
                        max_connections,
                        "connection limit reached, refusing"
                    );
                    drop(accepted);
                    tokio::time::sleep(REFUSE_PAUSE).await;
                    continue;
                }
                spawn_connection(&ctx, accepted);
            }
            Err(TransportError::Handshake(e)) => {
                debug!(transport = kind, error = %e, "handshake failed");
            }
            Err(e) => {
                error!(transport = kind, error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_RETRY).await;
            }
        }
    }
    info!(transport = kind, "accept loop stopped");
}
