//! Placement Engine: the cooldown-gated write path onto the shared grid.
//!
//! ```text
//! place_cell(request)
//!     │ validate (identity present → integers → bounds → palette → known identity)
//!     ▼
//! CooldownTracker::acquire(identity)        ── per-identity async mutex, bounded wait
//!     │ now < next_allowed_at ? ──► Ok(outcome without placed_at)
//!     ▼
//! commit sequencer (one short critical section for all identities)
//!     │ placed_at = max(clock, newest feed placed_at)
//!     │ CanvasStore::commit_placement   (identity + cell + feed record, atomic)
//!     │ GridStore::commit
//!     │ ChangeFeed::append
//!     ▼
//! advance identity deadline, release identity
//!     ▼
//! Fanout::publish(ChannelPolicy::channels_for(event), event)   ── best effort
//! ```
//!
//! The identity mutex is what keeps one identity from committing twice inside
//! a cooldown window. The sequencer is what keeps feed order identical to the
//! order cells were written to the grid.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::RuntimeFlavor;

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::cooldown::CooldownTracker;
use crate::error::PlacementError;
use crate::fanout::{ChannelPolicy, Fanout, FeedEvent, GlobalChannel, NullFanout};
use crate::feed::ChangeFeed;
use crate::grid::GridStore;
use crate::store::{CanvasStore, MemoryStore, PlacementCommit, StoreError};
use crate::types::{
    Cell, ChangeRecord, Color, IdentityCreatedRecord, IdentityId, IdentityRecord, Position,
    Scalar, Timestamp,
};

/// A placement as submitted by a caller, before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceCellRequest {
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub x: Scalar,
    #[serde(default)]
    pub y: Scalar,
    #[serde(default)]
    pub color: Scalar,
}

impl PlaceCellRequest {
    pub fn new(identity: IdentityId, x: i64, y: i64, color: i64) -> Self {
        Self {
            identity: Some(identity.to_string()),
            x: x.into(),
            y: y.into(),
            color: color.into(),
        }
    }
}

/// Result of a placement attempt.
///
/// `placed_at` is `None` when the identity was still cooling down; in that
/// case nothing was written and `next_allowed_at` is the unchanged deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementOutcome {
    pub next_allowed_at: Timestamp,
    pub placed_at: Option<Timestamp>,
}

impl PlacementOutcome {
    pub fn is_placed(&self) -> bool {
        self.placed_at.is_some()
    }
}

/// Counters for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub placements: u64,
    pub rate_limited: u64,
    pub invalid_requests: u64,
    pub identities: usize,
    pub cells: usize,
    pub feed_len: usize,
    pub latest_sequence: u64,
}

#[derive(Default)]
struct Counters {
    placements: AtomicU64,
    rate_limited: AtomicU64,
    invalid_requests: AtomicU64,
}

pub struct PlacementEngine {
    config: EngineConfig,
    grid: GridStore,
    cooldowns: CooldownTracker,
    /// Commit sequencer; also owns the feed.
    sequencer: Mutex<ChangeFeed>,
    store: Arc<dyn CanvasStore>,
    fanout: Arc<dyn Fanout>,
    policy: Arc<dyn ChannelPolicy>,
    clock: Arc<dyn Clock>,
    counters: Counters,
}

impl PlacementEngine {
    /// In-memory engine with wall-clock time and no real-time delivery.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            grid: GridStore::new(),
            cooldowns: CooldownTracker::new(config.lock_timeout),
            sequencer: Mutex::new(ChangeFeed::new(config.feed_retention)),
            store: Arc::new(MemoryStore::new()),
            fanout: Arc::new(NullFanout),
            policy: Arc::new(GlobalChannel),
            clock: Arc::new(SystemClock),
            counters: Counters::default(),
            config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(EngineConfig::default())
    }

    pub fn with_store(mut self, store: Arc<dyn CanvasStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_fanout(mut self, fanout: Arc<dyn Fanout>) -> Self {
        self.fanout = fanout;
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn ChannelPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Load identities, cells and the feed tail from the store.
    pub fn recover(self) -> Result<Self, PlacementError> {
        let identities = self.store.load_identities()?;
        let cells = self.store.load_cells()?;
        let feed = self.store.load_feed()?;

        let identity_count = identities.len();
        self.cooldowns.restore(identities);
        for cell in &cells {
            self.grid.commit(*cell);
        }
        let feed = ChangeFeed::restore(self.config.feed_retention, feed);
        let latest = feed.latest_sequence();
        *self.lock_feed() = feed;

        log::info!(
            "Recovered {identity_count} identities, {} cells, feed at sequence {latest}",
            cells.len()
        );
        Ok(self)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ─── Identities ───────────────────────────────────────────────────

    /// Issue a fresh identity and announce it.
    pub async fn issue_identity(&self) -> Result<IdentityId, PlacementError> {
        let id = IdentityId::generate();
        let record = IdentityRecord {
            id,
            next_allowed_at: None,
        };
        self.with_store_retry("insert identity", || self.store.insert_identity(&record))
            .await?;
        self.cooldowns.register(id);
        log::info!("Issued identity {id}");

        self.publish(FeedEvent::IdentityCreated(IdentityCreatedRecord { id }));
        Ok(id)
    }

    /// When `identity` may place next; `None` if it never placed.
    pub async fn cooldown_deadline(&self, identity: &str) -> Result<Option<Timestamp>, PlacementError> {
        let token = identity.trim();
        if token.is_empty() {
            return Err(PlacementError::InvalidArgument("identity is required".into()));
        }
        let id = IdentityId::parse(token).ok_or_else(|| PlacementError::NotFound(token.to_string()))?;
        self.cooldowns.deadline(id).await
    }

    // ─── Placement ────────────────────────────────────────────────────

    /// Place a cell, or report when the identity may try again.
    pub async fn place_cell(&self, request: PlaceCellRequest) -> Result<PlacementOutcome, PlacementError> {
        let (id, position, color) = self.validate(&request).inspect_err(|e| {
            if e.kind() == crate::error::ErrorKind::InvalidArgument {
                self.counters.invalid_requests.fetch_add(1, Ordering::Relaxed);
            }
        })?;

        let mut guard = self.cooldowns.acquire(id).await?;
        let now = self.clock.now();

        if let Some(deadline) = guard.blocks(now) {
            self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
            log::debug!(
                "Identity {id} rate limited for {:?}",
                deadline.duration_since(now)
            );
            return Ok(PlacementOutcome {
                next_allowed_at: deadline,
                placed_at: None,
            });
        }

        let holder = guard.id();
        let (record, evicted) = self
            .with_store_retry("commit placement", || {
                commit_blocking(|| self.commit_locked(holder, position, color))
            })
            .await?;
        let next_allowed_at = record.placed_at.saturating_add(self.config.cooldown);
        guard.advance(next_allowed_at);
        drop(guard);

        self.counters.placements.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "Identity {id} placed color {} at {position} (seq {})",
            color.value(),
            record.sequence
        );

        if let Some(up_to) = evicted {
            if let Err(e) = self.store.trim_feed(up_to) {
                log::warn!("Failed to trim persisted feed up to {up_to}: {e}");
            }
        }
        self.publish(FeedEvent::CellPlaced(record));

        Ok(PlacementOutcome {
            next_allowed_at,
            placed_at: Some(record.placed_at),
        })
    }

    /// Convenience wrapper over [`place_cell`](Self::place_cell).
    pub async fn place(
        &self,
        identity: IdentityId,
        x: i64,
        y: i64,
        color: i64,
    ) -> Result<PlacementOutcome, PlacementError> {
        self.place_cell(PlaceCellRequest::new(identity, x, y, color)).await
    }

    fn validate(&self, request: &PlaceCellRequest) -> Result<(IdentityId, Position, Color), PlacementError> {
        let token = request
            .identity
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| PlacementError::InvalidArgument("identity is required".into()))?;

        let integer = |name: &str, value: &Scalar| {
            value.as_integer().ok_or_else(|| {
                PlacementError::InvalidArgument(format!("{name} must be an integer, got {value}"))
            })
        };
        let x = integer("x", &request.x)?;
        let y = integer("y", &request.y)?;
        let color = integer("color", &request.color)?;

        let position = Position::new(x, y)
            .ok_or_else(|| PlacementError::InvalidArgument(format!("out of bounds: ({x}, {y})")))?;
        let color = Color::new(color)
            .ok_or_else(|| PlacementError::InvalidArgument(format!("color out of range: {color}")))?;

        let id = IdentityId::parse(token)
            .filter(|id| self.cooldowns.contains(*id))
            .ok_or_else(|| PlacementError::NotFound(token.to_string()))?;

        Ok((id, position, color))
    }

    /// One commit attempt under the sequencer. On error nothing changed.
    ///
    /// `placed_at` is read here, never below the newest feed record, so feed
    /// order and `placed_at` order agree.
    fn commit_locked(
        &self,
        id: IdentityId,
        position: Position,
        color: Color,
    ) -> Result<(ChangeRecord, Option<u64>), StoreError> {
        let mut feed = self.lock_feed();
        let now = match feed.latest_placed_at() {
            Some(newest) => self.clock.now().max(newest),
            None => self.clock.now(),
        };
        let identity = IdentityRecord {
            id,
            next_allowed_at: Some(now.saturating_add(self.config.cooldown)),
        };
        let record = ChangeRecord {
            sequence: feed.next_sequence(),
            position,
            color,
            placed_at: now,
        };
        self.store.commit_placement(&PlacementCommit { identity, record })?;
        self.grid.commit(record.cell());
        let evicted = feed.append(record).map(|old| old.sequence);
        Ok((record, evicted))
    }

    /// Run a store operation, retrying retryable failures until
    /// `store_grace` runs out.
    async fn with_store_retry<T>(
        &self,
        what: &str,
        mut op: impl FnMut() -> Result<T, StoreError>,
    ) -> Result<T, PlacementError> {
        let started = tokio::time::Instant::now();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match op() {
                Ok(value) => {
                    if attempts > 1 {
                        log::info!("{what} succeeded after {attempts} attempts");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_retryable()
                    && started.elapsed() + self.config.store_retry_backoff < self.config.store_grace =>
                {
                    log::warn!("{what} failed (attempt {attempts}), retrying: {e}");
                    tokio::time::sleep(self.config.store_retry_backoff).await;
                }
                Err(e) => {
                    log::error!("{what} failed after {attempts} attempts: {e}");
                    return Err(PlacementError::Unavailable(format!("{what}: {e}")));
                }
            }
        }
    }

    fn publish(&self, event: FeedEvent) {
        let channels = self.policy.channels_for(&event);
        match self.fanout.publish(&channels, &event) {
            Ok(delivered) => log::trace!("Fanned out event to {delivered} subscribers"),
            Err(e) => log::warn!("Fanout failed: {e}"),
        }
    }

    // ─── Queries ──────────────────────────────────────────────────────

    /// Current cells, optionally only those placed at or after `since`.
    ///
    /// `since` is a millisecond count or an RFC 3339 string. Each position
    /// appears at most once, with its latest value.
    pub fn get_cells(&self, since: Option<&str>) -> Result<Vec<Cell>, PlacementError> {
        match since {
            None => Ok(self.grid.snapshot()),
            Some(raw) => {
                let since = Timestamp::parse(raw).ok_or_else(|| {
                    PlacementError::InvalidArgument(format!("invalid since timestamp: {raw:?}"))
                })?;
                Ok(self.grid.cells_since(since))
            }
        }
    }

    /// The cell at a position, if any.
    pub fn cell_at(&self, position: Position) -> Option<Cell> {
        self.grid.get(position)
    }

    /// Feed records after `sequence`, or `None` if that window was evicted.
    pub fn changes_since(&self, sequence: u64) -> Option<Vec<ChangeRecord>> {
        self.lock_feed().since_sequence(sequence)
    }

    pub fn latest_sequence(&self) -> u64 {
        self.lock_feed().latest_sequence()
    }

    pub fn stats(&self) -> EngineStats {
        let (feed_len, latest_sequence) = {
            let feed = self.lock_feed();
            (feed.len(), feed.latest_sequence())
        };
        EngineStats {
            placements: self.counters.placements.load(Ordering::Relaxed),
            rate_limited: self.counters.rate_limited.load(Ordering::Relaxed),
            invalid_requests: self.counters.invalid_requests.load(Ordering::Relaxed),
            identities: self.cooldowns.len(),
            cells: self.grid.len(),
            feed_len,
            latest_sequence,
        }
    }

    /// Flush the backing store.
    pub fn flush(&self) -> Result<(), PlacementError> {
        self.store.flush().map_err(PlacementError::from)
    }

    fn lock_feed(&self) -> std::sync::MutexGuard<'_, ChangeFeed> {
        self.sequencer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Run a synchronous store commit. On a multi-threaded runtime the worker
/// is handed off first so a slow fsync doesn't stall other tasks.
fn commit_blocking<T>(commit: impl FnOnce() -> T) -> T {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(commit)
        }
        _ => commit(),
    }
}
