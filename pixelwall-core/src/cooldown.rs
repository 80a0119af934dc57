//! Identity & Cooldown Tracker.
//!
//! Every identity owns its own async mutex around `next_allowed_at`.
//! The placement engine holds that mutex for the whole check-and-commit, so
//! two requests from one identity can never both pass the cooldown check.
//! Requests from different identities never contend here.
//!
//! There is no public way to write a deadline; the only writer is
//! [`CooldownGuard::advance`], reachable from the engine's commit path.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::PlacementError;
use crate::types::{IdentityId, IdentityRecord, Timestamp};

#[derive(Debug, Default)]
struct Slot {
    next_allowed_at: Option<Timestamp>,
}

pub struct CooldownTracker {
    identities: RwLock<HashMap<IdentityId, Arc<Mutex<Slot>>>>,
    lock_timeout: Duration,
}

/// Exclusive hold on one identity's atomic unit.
pub(crate) struct CooldownGuard {
    id: IdentityId,
    slot: OwnedMutexGuard<Slot>,
}

impl CooldownGuard {
    pub(crate) fn id(&self) -> IdentityId {
        self.id
    }

    pub(crate) fn next_allowed_at(&self) -> Option<Timestamp> {
        self.slot.next_allowed_at
    }

    /// Still cooling down at `now`?
    pub(crate) fn blocks(&self, now: Timestamp) -> Option<Timestamp> {
        self.slot.next_allowed_at.filter(|deadline| now < *deadline)
    }

    /// Move the deadline forward. Never moves it backwards.
    pub(crate) fn advance(&mut self, deadline: Timestamp) {
        let current = self.slot.next_allowed_at.unwrap_or(Timestamp::EPOCH);
        self.slot.next_allowed_at = Some(current.max(deadline));
    }
}

impl CooldownTracker {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            identities: RwLock::new(HashMap::new()),
            lock_timeout,
        }
    }

    /// The identity's cooldown deadline; `None` if it never placed.
    pub async fn deadline(&self, id: IdentityId) -> Result<Option<Timestamp>, PlacementError> {
        let guard = self.acquire(id).await?;
        Ok(guard.next_allowed_at())
    }

    pub fn contains(&self, id: IdentityId) -> bool {
        self.read_map().contains_key(&id)
    }

    /// Number of known identities.
    pub fn len(&self) -> usize {
        self.read_map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a new identity with no deadline. Returns `false` if it was
    /// already known.
    pub(crate) fn register(&self, id: IdentityId) -> bool {
        let mut map = self.identities.write().unwrap_or_else(PoisonError::into_inner);
        if map.contains_key(&id) {
            return false;
        }
        map.insert(id, Arc::new(Mutex::new(Slot::default())));
        true
    }

    /// Load persisted identities, replacing any in-memory state for them.
    pub(crate) fn restore(&self, records: impl IntoIterator<Item = IdentityRecord>) {
        let mut map = self.identities.write().unwrap_or_else(PoisonError::into_inner);
        for record in records {
            map.insert(
                record.id,
                Arc::new(Mutex::new(Slot {
                    next_allowed_at: record.next_allowed_at,
                })),
            );
        }
    }

    /// Take the identity's atomic unit, waiting at most `lock_timeout`.
    pub(crate) async fn acquire(&self, id: IdentityId) -> Result<CooldownGuard, PlacementError> {
        let slot = self
            .read_map()
            .get(&id)
            .cloned()
            .ok_or_else(|| PlacementError::NotFound(id.to_string()))?;

        match tokio::time::timeout(self.lock_timeout, slot.lock_owned()).await {
            Ok(slot) => Ok(CooldownGuard { id, slot }),
            Err(_) => {
                log::warn!("Cooldown lock for identity {id} not acquired within {:?}", self.lock_timeout);
                Err(PlacementError::lock_timeout(format_args!("identity {id}")))
            }
        }
    }

    fn read_map(&self) -> std::sync::RwLockReadGuard<'_, HashMap<IdentityId, Arc<Mutex<Slot>>>> {
        self.identities.read().unwrap_or_else(PoisonError::into_inner)
    }
}
