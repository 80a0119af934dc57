//! Persistence contract for identities, cells and the change feed.
//!
//! The engine keeps the authoritative state in memory and writes through to
//! a [`CanvasStore`] before making a placement visible. A placement's
//! identity deadline, cell and feed record go to the store as one atomic
//! write ([`CanvasStore::commit_placement`]).

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

use crate::types::{Cell, ChangeRecord, IdentityId, IdentityRecord};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Store cannot be reached right now
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl StoreError {
    /// Worth retrying after a short pause.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Io(_))
    }
}

/// Everything one successful placement writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacementCommit {
    /// Identity with its new `next_allowed_at`.
    pub identity: IdentityRecord,
    pub record: ChangeRecord,
}

impl PlacementCommit {
    pub fn cell(&self) -> Cell {
        self.record.cell()
    }
}

pub trait CanvasStore: Send + Sync {
    fn insert_identity(&self, record: &IdentityRecord) -> Result<(), StoreError>;

    /// Persist identity deadline, cell upsert and feed record atomically.
    fn commit_placement(&self, commit: &PlacementCommit) -> Result<(), StoreError>;

    /// Delete feed records with `sequence ≤ up_to`. Returns how many were removed.
    fn trim_feed(&self, up_to: u64) -> Result<u64, StoreError>;

    fn load_identities(&self) -> Result<Vec<IdentityRecord>, StoreError>;

    fn load_cells(&self) -> Result<Vec<Cell>, StoreError>;

    /// Persisted feed records in sequence order.
    fn load_feed(&self) -> Result<Vec<ChangeRecord>, StoreError>;

    /// Make prior writes durable.
    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Default)]
struct MemoryTables {
    identities: HashMap<IdentityId, IdentityRecord>,
    cells: BTreeMap<[u8; 4], Cell>,
    feed: BTreeMap<u64, ChangeRecord>,
}

/// In-process store. Loses everything on drop.
///
/// Writes can be made to fail on demand, which is how the engine's
/// retry and `Unavailable` paths are tested.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<MemoryTables>,
    down: AtomicBool,
    fail_next: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While `true`, every write fails with `Unavailable`.
    pub fn set_unavailable(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Fail the next `n` writes with `Unavailable`.
    pub fn fail_next_writes(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store marked down".into()));
        }
        let blip = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if blip {
            return Err(StoreError::Unavailable("injected write failure".into()));
        }
        Ok(())
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, MemoryTables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CanvasStore for MemoryStore {
    fn insert_identity(&self, record: &IdentityRecord) -> Result<(), StoreError> {
        self.check_writable()?;
        self.tables().identities.insert(record.id, *record);
        Ok(())
    }

    fn commit_placement(&self, commit: &PlacementCommit) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut tables = self.tables();
        let cell = commit.cell();
        tables.identities.insert(commit.identity.id, commit.identity);
        tables.cells.insert(cell.position.to_key(), cell);
        tables.feed.insert(commit.record.sequence, commit.record);
        Ok(())
    }

    fn trim_feed(&self, up_to: u64) -> Result<u64, StoreError> {
        let mut tables = self.tables();
        let keep = tables.feed.split_off(&(up_to.saturating_add(1)));
        let removed = tables.feed.len() as u64;
        tables.feed = keep;
        Ok(removed)
    }

    fn load_identities(&self) -> Result<Vec<IdentityRecord>, StoreError> {
        Ok(self.tables().identities.values().copied().collect())
    }

    fn load_cells(&self) -> Result<Vec<Cell>, StoreError> {
        Ok(self.tables().cells.values().copied().collect())
    }

    fn load_feed(&self) -> Result<Vec<ChangeRecord>, StoreError> {
        Ok(self.tables().feed.values().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Color, Position, Timestamp};

    fn commit(seq: u64, x: i64, color: i64) -> PlacementCommit {
        let id = IdentityId::generate();
        PlacementCommit {
            identity: IdentityRecord {
                id,
                next_allowed_at: Some(Timestamp::from_millis(5_000)),
            },
            record: ChangeRecord {
                sequence: seq,
                position: Position::new(x, 0).unwrap(),
                color: Color::new(color).unwrap(),
                placed_at: Timestamp::from_millis(0),
            },
        }
    }

    #[test]
    fn test_commit_writes_all_three_tables() {
        let store = MemoryStore::new();
        store.commit_placement(&commit(1, 3, 4)).unwrap();
        assert_eq!(store.load_identities().unwrap().len(), 1);
        assert_eq!(store.load_cells().unwrap().len(), 1);
        assert_eq!(store.load_feed().unwrap().len(), 1);
    }

    #[test]
    fn test_cells_upsert_by_position() {
        let store = MemoryStore::new();
        store.commit_placement(&commit(1, 3, 4)).unwrap();
        store.commit_placement(&commit(2, 3, 9)).unwrap();
        let cells = store.load_cells().unwrap();
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].color.value(), 9);
    }

    #[test]
    fn test_trim_feed() {
        let store = MemoryStore::new();
        for seq in 1..=5 {
            store.commit_placement(&commit(seq, seq as i64, 1)).unwrap();
        }
        assert_eq!(store.trim_feed(3).unwrap(), 3);
        let seqs: Vec<u64> = store.load_feed().unwrap().iter().map(|r| r.sequence).collect();
        assert_eq!(seqs, vec![4, 5]);
    }

    #[test]
    fn test_injected_failures() {
        let store = MemoryStore::new();
        store.fail_next_writes(1);
        let err = store.commit_placement(&commit(1, 0, 0)).unwrap_err();
        assert!(err.is_retryable());
        assert!(store.commit_placement(&commit(1, 0, 0)).is_ok());

        store.set_unavailable(true);
        assert!(store.insert_identity(&commit(2, 0, 0).identity).is_err());
        store.set_unavailable(false);
        assert!(store.insert_identity(&commit(2, 0, 0).identity).is_ok());
    }

    #[test]
    fn test_error_retryability() {
        assert!(StoreError::Io("disk".into()).is_retryable());
        assert!(!StoreError::Serialization("bad".into()).is_retryable());
    }
}
