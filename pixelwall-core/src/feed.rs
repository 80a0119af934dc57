//! Change Feed: bounded, insertion-ordered log of committed placements.
//!
//! Records are appended by the engine while it holds the commit sequencer,
//! so feed order is the commit order. When the feed is full the oldest
//! record is evicted; a reader asking for a window that has been evicted is
//! told so and must fall back to a grid query.

use std::collections::VecDeque;

use crate::types::{ChangeRecord, Timestamp};

pub struct ChangeFeed {
    records: VecDeque<ChangeRecord>,
    retention: usize,
    /// Sequence the next appended record receives.
    next_sequence: u64,
}

impl ChangeFeed {
    pub fn new(retention: usize) -> Self {
        let retention = retention.max(1);
        Self {
            records: VecDeque::with_capacity(retention.min(4096)),
            retention,
            next_sequence: 1,
        }
    }

    /// Rebuild from persisted records (any order), keeping the newest
    /// `retention` of them.
    pub fn restore(retention: usize, mut records: Vec<ChangeRecord>) -> Self {
        records.sort_by_key(|r| r.sequence);
        let mut feed = Self::new(retention);
        if let Some(last) = records.last() {
            feed.next_sequence = last.sequence + 1;
        }
        let skip = records.len().saturating_sub(feed.retention);
        feed.records.extend(records.into_iter().skip(skip));
        feed
    }

    /// Sequence number the next record will receive.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Append a record. Its sequence must be `next_sequence()`.
    /// Returns the evicted record, if any.
    pub(crate) fn append(&mut self, record: ChangeRecord) -> Option<ChangeRecord> {
        debug_assert_eq!(record.sequence, self.next_sequence);
        self.next_sequence = record.sequence + 1;
        self.records.push_back(record);
        if self.records.len() > self.retention {
            self.records.pop_front()
        } else {
            None
        }
    }

    /// `placed_at` of the newest retained record.
    pub fn latest_placed_at(&self) -> Option<Timestamp> {
        self.records.back().map(|r| r.placed_at)
    }

    /// Sequence of the newest record, 0 if nothing was ever appended.
    pub fn latest_sequence(&self) -> u64 {
        self.next_sequence - 1
    }

    /// Sequence of the oldest retained record.
    pub fn oldest_sequence(&self) -> Option<u64> {
        self.records.front().map(|r| r.sequence)
    }

    /// Records with `sequence > after`, in commit order.
    ///
    /// `None` means some of the requested records were already evicted.
    pub fn since_sequence(&self, after: u64) -> Option<Vec<ChangeRecord>> {
        if after >= self.latest_sequence() {
            return Some(Vec::new());
        }
        let oldest = self.oldest_sequence()?;
        if after + 1 < oldest {
            return None;
        }
        let start = (after + 1 - oldest) as usize;
        Some(self.records.iter().skip(start).copied().collect())
    }

    /// Retained records with `placed_at ≥ since`, in commit order.
    pub fn since_timestamp(&self, since: Timestamp) -> Vec<ChangeRecord> {
        self.records
            .iter()
            .filter(|r| r.placed_at >= since)
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn retention(&self) -> usize {
        self.retention
    }
}
