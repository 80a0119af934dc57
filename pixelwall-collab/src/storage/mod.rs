//! Persistent storage for the canvas.
//!
//! Architecture:
//! ```text
//! ┌─────────────────┐  commit_placement  ┌──────────────┐
//! │ PlacementEngine │ ─────────────────► │ RocksStore   │
//! │ (in-memory)     │   (one WriteBatch) │ (RocksDB)    │
//! └────────┬────────┘                    └──────┬───────┘
//!          │                                    │
//!          │ recover() on startup               │ column families
//!          ▼                                    ▼
//! ┌─────────────────┐   ┌───────────────────────────────────────┐
//! │ Grid, cooldowns │   │ CF "identities" — id → deadline        │
//! │ feed tail       │   │ CF "cells"      — (y, x) → cell        │
//! └─────────────────┘   │ CF "feed"       — sequence → record    │
//!                       │ CF "metadata"   — grid shape, created  │
//!                       └───────────────────────────────────────┘
//! ```
//!
//! The store implements [`pixelwall_core::CanvasStore`], so the engine
//! never sees RocksDB directly.

pub mod rocks;

pub use pixelwall_core::StoreError;
pub use rocks::{RocksStore, StoreConfig, StoreMetadata};
