//! WebSocket client for the canvas server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect)
//! - Request/response calls correlated by `request_id`
//! - Pushed feed events delivered as [`ClientEvent`]s
//! - Resynchronization after a reconnect, from the feed when possible and
//!   from a `get_cells(since)` snapshot otherwise

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use pixelwall_core::{
    Cell, ChangeRecord, ErrorKind, FeedEvent, IdentityId, PlaceCellRequest, PlacementError,
    PlacementOutcome, Timestamp,
};

use crate::protocol::{
    ClientRequest, Outcome, ProtocolError, RequestBody, RequestId, ResponsePayload, ServerFrame,
    Since,
};

const EVENT_QUEUE: usize = 1024;
const OUTGOING_QUEUE: usize = 256;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    CellPlaced(ChangeRecord),
    IdentityCreated(IdentityId),
}

/// How a [`CanvasClient::resync`] caught up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resync {
    /// Every missed record, in commit order.
    Replayed(Vec<ChangeRecord>),
    /// Final values of cells changed since the last seen timestamp.
    Snapshot(Vec<Cell>),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("not connected")]
    NotConnected,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Server(#[from] PlacementError),
}

impl ClientError {
    /// Server-side error kind, when the server answered with an error.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ClientError::Server(e) => Some(e.kind()),
            _ => None,
        }
    }
}

/// How far into the change feed this client has seen.
///
/// `sequence` only advances over an unbroken run of records; records
/// that arrive above a gap are kept aside until the gap fills.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedCursor {
    sequence: u64,
    ahead: BTreeSet<u64>,
    last_timestamp: Option<Timestamp>,
}

impl FeedCursor {
    /// Every record with a sequence at or below this one has been seen.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Newest `placed_at` seen in a record or snapshot.
    pub fn last_timestamp(&self) -> Option<Timestamp> {
        self.last_timestamp
    }

    /// Whether records above a missing one have been seen.
    pub fn has_gap(&self) -> bool {
        !self.ahead.is_empty()
    }

    /// Nothing seen yet.
    pub fn is_fresh(&self) -> bool {
        self.sequence == 0 && self.ahead.is_empty() && self.last_timestamp.is_none()
    }

    pub fn observe(&mut self, record: &ChangeRecord) {
        self.observe_timestamp(record.placed_at);
        if record.sequence <= self.sequence {
            return;
        }
        self.ahead.insert(record.sequence);
        self.settle();
    }

    pub fn observe_cells(&mut self, cells: &[Cell]) {
        for cell in cells {
            self.observe_timestamp(cell.placed_at);
        }
    }

    /// Treat everything up to `sequence` as seen.
    pub fn advance_to(&mut self, sequence: u64) {
        if sequence > self.sequence {
            self.sequence = sequence;
            self.ahead = self.ahead.split_off(&(sequence + 1));
            self.settle();
        }
    }

    fn observe_timestamp(&mut self, ts: Timestamp) {
        self.last_timestamp = Some(self.last_timestamp.map_or(ts, |prev| prev.max(ts)));
    }

    fn settle(&mut self) {
        while self.ahead.remove(&(self.sequence + 1)) {
            self.sequence += 1;
        }
    }
}

type Pending = Arc<Mutex<HashMap<RequestId, oneshot::Sender<Outcome>>>>;

/// The canvas client.
pub struct CanvasClient {
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    cursor: Arc<Mutex<FeedCursor>>,
    pending: Pending,
    /// Bumped on every connect and disconnect; a reader task only tears
    /// down state that still belongs to its own connection.
    generation: Arc<AtomicU64>,
    next_request_id: AtomicU64,
    request_timeout: Duration,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Message>>,

    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    event_tx: mpsc::Sender<ClientEvent>,
}

impl CanvasClient {
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        Self {
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            cursor: Arc::new(Mutex::new(FeedCursor::default())),
            pending: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
            next_request_id: AtomicU64::new(1),
            request_timeout: Duration::from_secs(10),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// Spawns the reader and writer tasks. The server subscribes the
    /// connection to the default channel before answering any request.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        *self.state.write().await = ConnectionState::Connecting;
        let connection = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ClientError::Connect(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTGOING_QUEUE);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = msg.is_close();
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        *self.state.write().await = ConnectionState::Connected;
        emit(&self.event_tx, ClientEvent::Connected);

        // Reader task: route responses and events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let pending = self.pending.clone();
        let cursor = self.cursor.clone();
        let generation = self.generation.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                match ServerFrame::decode(text.as_str()) {
                    Ok(ServerFrame::Response { request_id, result }) => {
                        match pending.lock().await.remove(&request_id) {
                            Some(waiter) => {
                                let _ = waiter.send(result);
                            }
                            None => log::warn!("Response for unknown request {request_id}: {result:?}"),
                        }
                    }
                    Ok(ServerFrame::Event { event }) => {
                        let client_event = match event {
                            FeedEvent::CellPlaced(record) => {
                                cursor.lock().await.observe(&record);
                                ClientEvent::CellPlaced(record)
                            }
                            FeedEvent::IdentityCreated(record) => ClientEvent::IdentityCreated(record.id),
                        };
                        emit(&event_tx, client_event);
                    }
                    Err(e) => log::warn!("Failed to decode server frame: {e}"),
                }
            }

            // Connection lost: fail outstanding requests
            if generation.load(Ordering::SeqCst) == connection {
                *state.write().await = ConnectionState::Disconnected;
                pending.lock().await.clear();
                emit(&event_tx, ClientEvent::Disconnected);
            }
        });

        log::info!("Connected to {}", self.server_url);
        Ok(())
    }

    /// Close the connection. Outstanding requests fail with `ConnectionClosed`.
    pub async fn disconnect(&mut self) {
        let Some(tx) = self.outgoing_tx.take() else {
            return;
        };
        self.generation.fetch_add(1, Ordering::SeqCst);
        *self.state.write().await = ConnectionState::Disconnected;
        self.pending.lock().await.clear();
        let _ = tx.send(Message::Close(None)).await;
        emit(&self.event_tx, ClientEvent::Disconnected);
        log::info!("Disconnected from {}", self.server_url);
    }

    /// Connect again and catch up on what was missed.
    pub async fn reconnect(&mut self) -> Result<Resync, ClientError> {
        self.disconnect().await;
        self.connect().await?;
        self.resync().await
    }

    // ─── Requests ─────────────────────────────────────────────────────

    pub async fn issue_identity(&self) -> Result<IdentityId, ClientError> {
        match self.request(RequestBody::IssueIdentity).await? {
            ResponsePayload::Identity { identity } => Ok(identity),
            other => Err(unexpected(other)),
        }
    }

    /// Place a cell. A rate-limited attempt is `Ok` with `placed_at: None`.
    pub async fn place_cell(
        &self,
        identity: IdentityId,
        x: i64,
        y: i64,
        color: i64,
    ) -> Result<PlacementOutcome, ClientError> {
        let body = RequestBody::PlaceCell(PlaceCellRequest::new(identity, x, y, color));
        match self.request(body).await? {
            ResponsePayload::Placement(outcome) => Ok(outcome),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_cells(&self, since: Option<Timestamp>) -> Result<Vec<Cell>, ClientError> {
        let body = RequestBody::GetCells {
            since: since.map(Since::from),
        };
        match self.request(body).await? {
            ResponsePayload::Cells { cells } => Ok(cells),
            other => Err(unexpected(other)),
        }
    }

    pub async fn cooldown(&self, identity: IdentityId) -> Result<Option<Timestamp>, ClientError> {
        let body = RequestBody::GetCooldown {
            identity: identity.to_string(),
        };
        match self.request(body).await? {
            ResponsePayload::Cooldown { next_allowed_at } => Ok(next_allowed_at),
            other => Err(unexpected(other)),
        }
    }

    /// Feed records after `sequence`; `None` if the server no longer has them.
    pub async fn changes_since(&self, sequence: u64) -> Result<Option<Vec<ChangeRecord>>, ClientError> {
        match self.request(RequestBody::ChangesSince { sequence }).await? {
            ResponsePayload::Changes { records, .. } => Ok(records),
            other => Err(unexpected(other)),
        }
    }

    /// Round trip; returns the server's latest feed sequence.
    pub async fn ping(&self) -> Result<u64, ClientError> {
        match self.request(RequestBody::Ping).await? {
            ResponsePayload::Pong { latest_sequence } => Ok(latest_sequence),
            other => Err(unexpected(other)),
        }
    }

    /// Catch up after missing events.
    ///
    /// Replays the feed from the cursor when the server still holds that
    /// window. Otherwise (or on first sync) fetches the cells changed since
    /// the last seen timestamp.
    pub async fn resync(&self) -> Result<Resync, ClientError> {
        let cursor = self.cursor().await;

        if !cursor.is_fresh() {
            if let Some(records) = self.changes_since(cursor.sequence()).await? {
                let mut current = self.cursor.lock().await;
                for record in &records {
                    current.observe(record);
                }
                log::info!("Resynced {} records from the feed", records.len());
                return Ok(Resync::Replayed(records));
            }
            log::info!("Feed window after {} is gone, falling back to a snapshot", cursor.sequence());
        }

        let latest = self.ping().await?;
        let cells = self.get_cells(cursor.last_timestamp()).await?;
        {
            let mut current = self.cursor.lock().await;
            current.advance_to(latest);
            current.observe_cells(&cells);
        }
        log::info!("Resynced {} cells from a snapshot", cells.len());
        Ok(Resync::Snapshot(cells))
    }

    async fn request(&self, body: RequestBody) -> Result<ResponsePayload, ClientError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        let out = self.outgoing_tx.as_ref().ok_or(ClientError::NotConnected)?;

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let text = ClientRequest::new(request_id, body).encode()?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, tx);

        if out.send(Message::text(text)).await.is_err() {
            self.pending.lock().await.remove(&request_id);
            return Err(ProtocolError::ConnectionClosed.into());
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(outcome)) => Ok(outcome.into_result()?),
            Ok(Err(_)) => Err(ProtocolError::ConnectionClosed.into()),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                Err(ProtocolError::Timeout.into())
            }
        }
    }

    // ─── Accessors ────────────────────────────────────────────────────

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn cursor(&self) -> FeedCursor {
        self.cursor.lock().await.clone()
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn pending_requests(&self) -> usize {
        self.pending.lock().await.len()
    }
}

fn emit(event_tx: &mpsc::Sender<ClientEvent>, event: ClientEvent) {
    if let Err(mpsc::error::TrySendError::Full(event)) = event_tx.try_send(event) {
        log::warn!("Event queue full, dropping {event:?}");
    }
}

fn unexpected(payload: ResponsePayload) -> ClientError {
    ProtocolError::UnexpectedResponse(format!("{payload:?}")).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pixelwall_core::{Color, Position};

    fn record(sequence: u64, at: i64) -> ChangeRecord {
        ChangeRecord {
            sequence,
            position: Position::new(1, 1).unwrap(),
            color: Color::new(1).unwrap(),
            placed_at: Timestamp::from_millis(at),
        }
    }

    #[test]
    fn test_cursor_advances_over_contiguous_records() {
        let mut cursor = FeedCursor::default();
        assert!(cursor.is_fresh());
        cursor.observe(&record(1, 10));
        cursor.observe(&record(2, 20));
        assert_eq!(cursor.sequence(), 2);
        assert_eq!(cursor.last_timestamp(), Some(Timestamp::from_millis(20)));
        assert!(!cursor.has_gap());
    }

    #[test]
    fn test_cursor_waits_for_gap() {
        let mut cursor = FeedCursor::default();
        cursor.observe(&record(1, 10));
        cursor.observe(&record(3, 30));
        cursor.observe(&record(4, 25));
        assert_eq!(cursor.sequence(), 1);
        assert!(cursor.has_gap());
        assert_eq!(cursor.last_timestamp(), Some(Timestamp::from_millis(30)));

        cursor.observe(&record(2, 20));
        assert_eq!(cursor.sequence(), 4);
        assert!(!cursor.has_gap());
    }

    #[test]
    fn test_cursor_advance_to_drops_stale_ahead() {
        let mut cursor = FeedCursor::default();
        cursor.observe(&record(5, 0));
        cursor.observe(&record(9, 0));
        cursor.advance_to(6);
        assert_eq!(cursor.sequence(), 6);
        assert!(cursor.has_gap());
        cursor.advance_to(8);
        assert_eq!(cursor.sequence(), 9);
        assert!(!cursor.has_gap());
        cursor.advance_to(3);
        assert_eq!(cursor.sequence(), 9);
    }

    #[test]
    fn test_cursor_duplicates_ignored() {
        let mut cursor = FeedCursor::default();
        cursor.observe(&record(1, 0));
        cursor.observe(&record(1, 0));
        assert_eq!(cursor.sequence(), 1);
        assert!(!cursor.has_gap());
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let mut client = CanvasClient::new("ws://127.0.0.1:8000");
        assert_eq!(client.server_url(), "ws://127.0.0.1:8000");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert!(client.cursor().await.is_fresh());
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_requests_fail_when_disconnected() {
        let client = CanvasClient::new("ws://127.0.0.1:8000");
        let err = client.issue_identity().await.unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
        assert_eq!(err.kind(), None);
        assert_eq!(client.pending_requests().await, 0);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut client = CanvasClient::new(format!("ws://127.0.0.1:{port}"));
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, ClientError::Connect(_)));
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }
}
