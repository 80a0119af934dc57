//! # pixelwall-collab — Real-time surfaces for the pixelwall canvas
//!
//! Puts the placement engine on the network: a JSON-over-WebSocket server,
//! a matching client, channel fan-out, and RocksDB persistence.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ CanvasClient │ ◄────────────────► │ CanvasServer │
//! │ (per user)   │     JSON frames    │ (central)    │
//! └──────┬───────┘                    └──────┬───────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌──────────────┐                    ┌─────────────────┐
//! │ FeedCursor   │                    │ PlacementEngine │
//! │ (resync)     │                    │ (authority)     │
//! └──────────────┘                    └──┬───────────┬──┘
//!                                        │           │
//!                                ┌───────┴─────┐ ┌───┴────────┐
//!                                │ ChannelHub  │ │ RocksStore │
//!                                │ (fan-out)   │ │ (durable)  │
//!                                └─────────────┘ └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Request, response and event frames (serde_json)
//! - [`broadcast`] — Channel fan-out with backpressure, implements `Fanout`
//! - [`server`] — WebSocket server and its configuration
//! - [`client`] — WebSocket client with feed cursor and resync
//! - [`storage`] — RocksDB-backed `CanvasStore`

pub mod broadcast;
pub mod client;
pub mod protocol;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, ChannelHub, ConnectionId, Frame};
pub use client::{CanvasClient, ClientError, ClientEvent, ConnectionState, FeedCursor, Resync};
pub use protocol::{
    ClientRequest, ErrorBody, MalformedRequest, Outcome, ProtocolError, RequestBody, RequestId,
    ResponsePayload, ServerFrame, Since,
};
pub use server::{CanvasServer, ServerConfig, ServerError, ServerStats};
pub use storage::{RocksStore, StoreConfig, StoreMetadata};
