//! WebSocket canvas server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌── RocksStore (optional)
//!            ├── Session ── PlacementEngine
//! Client B ──┘      ▲              │
//!                   │              └── ChannelHub ("anonymous")
//!                   │                        │
//!                   └──── event frames ◄─────┘
//! ```
//!
//! Every connection joins the default channel before its first request is
//! read, so it sees every event committed after it connected. Requests and
//! outgoing events are multiplexed on one task with `tokio::select!`.
//! On shutdown each open session is sent a Close frame and awaited before
//! the store is flushed.

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::{self, Message};
use uuid::Uuid;

use pixelwall_core::{Channel, EngineConfig, PlacementEngine, PlacementError, StoreError};

use crate::broadcast::ChannelHub;
use crate::protocol::{ClientRequest, ProtocolError, RequestBody, ResponsePayload, ServerFrame};
use crate::storage::{RocksStore, StoreConfig};

pub const ENV_BIND: &str = "PIXELWALL_BIND";
pub const ENV_PORT: &str = "PORT";
pub const ENV_DATA_DIR: &str = "PIXELWALL_DATA_DIR";
pub const ENV_COOLDOWN_MS: &str = "PIXELWALL_COOLDOWN_MS";

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8000;
/// How long shutdown waits for open sessions before aborting them.
const SESSION_DRAIN: Duration = Duration::from_secs(5);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per channel
    pub broadcast_capacity: usize,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("127.0.0.1:{DEFAULT_PORT}"),
            broadcast_capacity: 256,
            storage_path: None,
            engine: EngineConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Ephemeral port, in-memory store, test engine timings.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            broadcast_capacity: 64,
            storage_path: None,
            engine: EngineConfig::for_testing(),
        }
    }

    /// Read `PIXELWALL_BIND`, `PORT`, `PIXELWALL_DATA_DIR` and
    /// `PIXELWALL_COOLDOWN_MS`, falling back to defaults for unset variables.
    pub fn from_env() -> Result<Self, ServerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ServerError> {
        let mut config = Self::default();

        let host = lookup(ENV_BIND).unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = match lookup(ENV_PORT) {
            Some(raw) => raw
                .trim()
                .parse::<u16>()
                .map_err(|_| ServerError::Config(format!("{ENV_PORT} is not a port: {raw:?}")))?,
            None => DEFAULT_PORT,
        };
        config.bind_addr = format!("{host}:{port}");

        config.storage_path = lookup(ENV_DATA_DIR)
            .filter(|dir| !dir.trim().is_empty())
            .map(PathBuf::from);

        if let Some(raw) = lookup(ENV_COOLDOWN_MS) {
            let ms = raw.trim().parse::<u64>().map_err(|_| {
                ServerError::Config(format!("{ENV_COOLDOWN_MS} is not a millisecond count: {raw:?}"))
            })?;
            config.engine = config.engine.with_cooldown(Duration::from_millis(ms));
        }

        Ok(config)
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Engine(#[from] PlacementError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub requests: u64,
    pub bytes_received: u64,
    pub placements: u64,
    pub rate_limited: u64,
    pub errors: u64,
    pub events_forwarded: u64,
    pub events_dropped: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    requests: AtomicU64,
    bytes_received: AtomicU64,
    placements: AtomicU64,
    rate_limited: AtomicU64,
    errors: AtomicU64,
    events_forwarded: AtomicU64,
    events_dropped: AtomicU64,
}

impl AtomicServerStats {
    fn snapshot(&self) -> ServerStats {
        ServerStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            placements: self.placements.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            events_forwarded: self.events_forwarded.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
        }
    }

    fn record(&self, result: &Result<ResponsePayload, PlacementError>) {
        match result {
            Ok(ResponsePayload::Placement(outcome)) if outcome.is_placed() => {
                self.placements.fetch_add(1, Ordering::Relaxed);
            }
            Ok(ResponsePayload::Placement(_)) => {
                self.rate_limited.fetch_add(1, Ordering::Relaxed);
            }
            Ok(_) => {}
            Err(_) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// The canvas server.
pub struct CanvasServer {
    config: ServerConfig,
    engine: Arc<PlacementEngine>,
    hub: Arc<ChannelHub>,
    store: Option<Arc<RocksStore>>,
    stats: Arc<AtomicServerStats>,
    closing: watch::Sender<bool>,
}

impl CanvasServer {
    /// Build the engine, opening and recovering from the RocksDB store when
    /// `storage_path` is set.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let hub = Arc::new(ChannelHub::new(config.broadcast_capacity));
        let mut engine = PlacementEngine::new(config.engine.clone()).with_fanout(hub.clone());

        let store = match &config.storage_path {
            Some(path) => {
                let store = Arc::new(RocksStore::open(StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                })?);
                engine = engine.with_store(store.clone()).recover()?;
                Some(store)
            }
            None => None,
        };

        Ok(Self {
            config,
            engine: Arc::new(engine),
            hub,
            store,
            stats: Arc::new(AtomicServerStats::default()),
            closing: watch::Sender::new(false),
        })
    }

    /// In-memory server with default configuration.
    pub fn with_defaults() -> Result<Self, ServerError> {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until the process exits.
    pub async fn run(&self) -> Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections on `listener` until `shutdown` resolves. Open
    /// sessions are then closed and awaited before the store is flushed.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        log::info!("Canvas server listening on {}", listener.local_addr()?);
        tokio::pin!(shutdown);
        self.closing.send_replace(false);
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Shutdown requested, no longer accepting connections");
                    break;
                }
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        log::error!("Session task failed: {e}");
                    }
                }
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::warn!("Accept failed: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");
                    let session = self.session();
                    sessions.spawn(async move {
                        if let Err(e) = session.run(stream, addr).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
            }
        }

        self.closing.send_replace(true);
        if !sessions.is_empty() {
            log::info!("Closing {} open sessions", sessions.len());
        }
        let drained = tokio::time::timeout(SESSION_DRAIN, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            log::warn!("{} sessions still open after {SESSION_DRAIN:?}, aborting", sessions.len());
            sessions.abort_all();
            while sessions.join_next().await.is_some() {}
        }

        self.engine.flush()?;
        log::info!("Store flushed");
        Ok(())
    }

    /// Answer one request frame without a socket.
    pub async fn handle_text(&self, text: &str) -> ServerFrame {
        self.session().handle_text(text).await
    }

    pub fn stats(&self) -> ServerStats {
        self.stats.snapshot()
    }

    pub fn engine(&self) -> &Arc<PlacementEngine> {
        &self.engine
    }

    pub fn hub(&self) -> &Arc<ChannelHub> {
        &self.hub
    }

    /// Get the persistent store (if configured).
    pub fn store(&self) -> Option<&Arc<RocksStore>> {
        self.store.as_ref()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    fn session(&self) -> Session {
        Session {
            engine: self.engine.clone(),
            hub: self.hub.clone(),
            stats: self.stats.clone(),
            closing: self.closing.subscribe(),
        }
    }
}

/// Per-connection handle on the shared server state.
struct Session {
    engine: Arc<PlacementEngine>,
    hub: Arc<ChannelHub>,
    stats: Arc<AtomicServerStats>,
    /// Flips to `true` when the server shuts down.
    closing: watch::Receiver<bool>,
}

impl Session {
    async fn run(self, stream: TcpStream, addr: SocketAddr) -> Result<(), ServerError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let connection_id = Uuid::new_v4();
        let channel = Channel::global();
        let mut events = self.hub.join(&channel, connection_id);
        let mut closing = self.closing.clone();

        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        self.stats.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!("WebSocket connection {connection_id} established from {addr}");

        let result = async {
            loop {
                tokio::select! {
                    _ = closing.wait_for(|closed| *closed) => {
                        log::debug!("Closing connection {connection_id} for shutdown");
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    }

                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                self.stats
                                    .bytes_received
                                    .fetch_add(text.len() as u64, Ordering::Relaxed);
                                let frame = self.handle_text(text.as_str()).await;
                                ws_sender.send(Message::text(frame.encode()?)).await?;
                            }
                            Some(Ok(Message::Binary(_))) => {
                                log::warn!("Ignoring binary frame from {addr}");
                                let err = PlacementError::InvalidArgument(
                                    "binary frames are not supported".into(),
                                );
                                ws_sender
                                    .send(Message::text(ServerFrame::error(0, &err).encode()?))
                                    .await?;
                            }
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }
                            _ => {}
                        }
                    }

                    event = events.recv() => {
                        match event {
                            Ok(frame) => {
                                ws_sender.send(Message::text(frame.to_string())).await?;
                                self.stats.events_forwarded.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(RecvError::Lagged(n)) => {
                                log::warn!("Connection {connection_id} lagged by {n} events");
                                if let Some(group) = self.hub.get(&channel) {
                                    group.record_dropped(n);
                                }
                                self.stats.events_dropped.fetch_add(n, Ordering::Relaxed);
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }
                }
            }
            Ok::<(), ServerError>(())
        }
        .await;

        self.hub.leave(&channel, &connection_id);
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!("Connection {connection_id} from {addr} closed");
        result
    }

    async fn handle_text(&self, text: &str) -> ServerFrame {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        let request = match ClientRequest::decode(text) {
            Ok(request) => request,
            Err(malformed) => {
                log::debug!("{malformed}");
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                let err = PlacementError::InvalidArgument(malformed.reason);
                return ServerFrame::error(malformed.request_id.unwrap_or(0), &err);
            }
        };

        let request_id = request.request_id;
        let result = self.dispatch(request.body).await;
        if let Err(e) = &result {
            log::debug!("Request {request_id} failed: {e}");
        }
        self.stats.record(&result);
        ServerFrame::response(request_id, result)
    }

    async fn dispatch(&self, body: RequestBody) -> Result<ResponsePayload, PlacementError> {
        let engine = &self.engine;
        match body {
            RequestBody::IssueIdentity => engine
                .issue_identity()
                .await
                .map(|identity| ResponsePayload::Identity { identity }),
            RequestBody::PlaceCell(request) => {
                engine.place_cell(request).await.map(ResponsePayload::Placement)
            }
            RequestBody::GetCells { since } => {
                let since = since.map(|s| s.as_query());
                engine
                    .get_cells(since.as_deref())
                    .map(|cells| ResponsePayload::Cells { cells })
            }
            RequestBody::GetCooldown { identity } => engine
                .cooldown_deadline(&identity)
                .await
                .map(|next_allowed_at| ResponsePayload::Cooldown { next_allowed_at }),
            RequestBody::ChangesSince { sequence } => Ok(ResponsePayload::Changes {
                records: engine.changes_since(sequence),
                latest_sequence: engine.latest_sequence(),
            }),
            RequestBody::Ping => Ok(ResponsePayload::Pong {
                latest_sequence: engine.latest_sequence(),
            }),
        }
    }
}
