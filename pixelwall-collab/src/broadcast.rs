//! Channel fan-out with backpressure.
//!
//! Each channel is a tokio broadcast group: one send reaches every
//! subscribed connection, and each connection's receiver buffers up to
//! `capacity` frames. A connection that falls further behind loses the
//! oldest frames (it sees `RecvError::Lagged`) and is expected to resync.
//!
//! [`ChannelHub`] implements [`Fanout`] for the placement engine. An event
//! is encoded once into a [`ServerFrame`] and the same `Arc<str>` is handed
//! to every group in the channel set.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;
use uuid::Uuid;

use pixelwall_core::{Channel, ChannelSet, Fanout, FanoutError, FeedEvent};

use crate::protocol::ServerFrame;

/// An encoded server frame shared by all receivers.
pub type Frame = Arc<str>;

/// Identifies one WebSocket connection inside the hub.
pub type ConnectionId = Uuid;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_members: usize,
}

/// Atomic broadcast stats; `send` never takes a lock for them.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Broadcast group for one channel.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Frame>,
    members: RwLock<HashSet<ConnectionId>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` is how many frames a receiver may fall behind before it
    /// starts losing them.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            members: RwLock::new(HashSet::new()),
            capacity: capacity.max(1),
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Add a member and return its receiver.
    pub fn add_member(&self, id: ConnectionId) -> broadcast::Receiver<Frame> {
        self.members
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
        self.sender.subscribe()
    }

    pub fn remove_member(&self, id: &ConnectionId) -> bool {
        self.members
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    pub fn has_member(&self, id: &ConnectionId) -> bool {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    pub fn member_count(&self) -> usize {
        self.members.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Send a pre-encoded frame. Returns how many receivers it was queued for.
    pub fn send(&self, frame: Frame) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record frames a lagging receiver skipped.
    pub fn record_dropped(&self, n: u64) {
        self.stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_members: self.member_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps channel names to broadcast groups.
pub struct ChannelHub {
    groups: RwLock<HashMap<Channel, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl ChannelHub {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Get or create the group for a channel.
    pub fn get_or_create(&self, channel: &Channel) -> Arc<BroadcastGroup> {
        // Fast path: read lock
        if let Some(group) = self.get(channel) {
            return group;
        }

        let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
        groups
            .entry(channel.clone())
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.default_capacity)))
            .clone()
    }

    pub fn get(&self, channel: &Channel) -> Option<Arc<BroadcastGroup>> {
        self.groups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .cloned()
    }

    /// Subscribe a connection to a channel.
    ///
    /// Membership is added under the map lock so a concurrent `leave` can't
    /// drop the group in between.
    pub fn join(&self, channel: &Channel, id: ConnectionId) -> broadcast::Receiver<Frame> {
        let rx = {
            let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
            groups
                .entry(channel.clone())
                .or_insert_with(|| Arc::new(BroadcastGroup::new(self.default_capacity)))
                .add_member(id)
        };
        log::debug!("Connection {id} joined channel {channel}");
        rx
    }

    /// Unsubscribe a connection. Empty groups are dropped.
    pub fn leave(&self, channel: &Channel, id: &ConnectionId) {
        let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(group) = groups.get(channel) {
            group.remove_member(id);
            if group.member_count() == 0 {
                groups.remove(channel);
                log::debug!("Channel {channel} removed (empty)");
            }
        }
    }

    pub fn channel_count(&self) -> usize {
        self.groups.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.groups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Members across all channels, counting a connection once per channel.
    pub fn subscription_count(&self) -> usize {
        self.groups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|g| g.member_count())
            .sum()
    }
}

impl Fanout for ChannelHub {
    fn publish(&self, channels: &ChannelSet, event: &FeedEvent) -> Result<usize, FanoutError> {
        let encoded = ServerFrame::event(event.clone())
            .encode()
            .map_err(|e| FanoutError::Encoding(e.to_string()))?;
        let frame: Frame = Arc::from(encoded);

        let mut delivered = 0;
        for channel in channels.iter() {
            // A channel nobody joined has no group; nothing to deliver.
            if let Some(group) = self.get(channel) {
                delivered += group.send(frame.clone());
            }
        }
        Ok(delivered)
    }
}
