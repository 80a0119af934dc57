//! # pixelwall-core — Placement engine for a shared pixel canvas
//!
//! Many clients place colored cells on a 1024×1024 grid. Each client
//! identity may place at most once per cooldown window; every committed
//! placement is recorded in an ordered change feed and handed to a fanout
//! for real-time delivery.
//!
//! ## Architecture
//!
//! ```text
//!  place_cell ──► PlacementEngine ──┬──► CooldownTracker   (per-identity lock)
//!                                   ├──► CanvasStore       (durable, atomic commit)
//!                                   ├──► GridStore         (current cells)
//!                                   ├──► ChangeFeed        (bounded, ordered)
//!                                   └──► Fanout            (after commit, best effort)
//!
//!  get_cells(since) ──► GridStore::cells_since
//!  changes_since(seq) ──► ChangeFeed::since_sequence
//! ```
//!
//! ## Modules
//!
//! - [`engine`] — validation, atomic check-and-commit, queries
//! - [`grid`] — row-sharded arena of cell slots
//! - [`cooldown`] — identity registry and per-identity deadlines
//! - [`feed`] — change feed with count-based retention
//! - [`fanout`] — channels, channel policy, delivery trait
//! - [`store`] — persistence trait and in-memory store
//! - [`types`], [`error`], [`clock`], [`config`]

pub mod clock;
pub mod config;
pub mod cooldown;
pub mod engine;
pub mod error;
pub mod fanout;
pub mod feed;
pub mod grid;
pub mod store;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use engine::{EngineStats, PlaceCellRequest, PlacementEngine, PlacementOutcome};
pub use error::{ErrorKind, PlacementError};
pub use fanout::{
    Channel, ChannelPolicy, ChannelSet, Fanout, FanoutError, FeedEvent, GlobalChannel,
    NullFanout, DEFAULT_CHANNEL,
};
pub use store::{CanvasStore, MemoryStore, PlacementCommit, StoreError};
pub use types::{
    Cell, ChangeRecord, Color, IdentityCreatedRecord, IdentityId, IdentityRecord, Position,
    Scalar, Timestamp, GRID_HEIGHT, GRID_WIDTH, PALETTE_SIZE,
};
