//! Real-time delivery contract.
//!
//! The engine decides *which* channels an event goes to (through a
//! [`ChannelPolicy`]) and hands it to a [`Fanout`] after the commit. Who is
//! subscribed to which channel is entirely the fanout implementation's
//! business.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

use crate::types::{ChangeRecord, IdentityCreatedRecord};

/// Channel every client joins on connection.
pub const DEFAULT_CHANNEL: &str = "anonymous";

/// A named delivery group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Channel(String);

impl Channel {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The global channel.
    pub fn global() -> Self {
        Self(DEFAULT_CHANNEL.to_string())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deduplicated, ordered set of channels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelSet(BTreeSet<Channel>);

impl ChannelSet {
    pub fn single(channel: Channel) -> Self {
        Self(BTreeSet::from([channel]))
    }

    pub fn insert(&mut self, channel: Channel) -> bool {
        self.0.insert(channel)
    }

    pub fn contains(&self, channel: &Channel) -> bool {
        self.0.contains(channel)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Channel> for ChannelSet {
    fn from_iter<I: IntoIterator<Item = Channel>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Something subscribers are told about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "record", rename_all = "snake_case")]
pub enum FeedEvent {
    CellPlaced(ChangeRecord),
    IdentityCreated(IdentityCreatedRecord),
}

/// Chooses the channels for an event. Must be a pure function of the event.
pub trait ChannelPolicy: Send + Sync {
    fn channels_for(&self, event: &FeedEvent) -> ChannelSet;
}

/// Every event goes to [`DEFAULT_CHANNEL`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalChannel;

impl ChannelPolicy for GlobalChannel {
    fn channels_for(&self, _event: &FeedEvent) -> ChannelSet {
        ChannelSet::single(Channel::global())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FanoutError {
    #[error("encoding event failed: {0}")]
    Encoding(String),
    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// Delivers events to channel subscribers.
///
/// Returns how many subscriber deliveries were queued. Delivery is
/// best-effort; the engine logs errors and carries on.
pub trait Fanout: Send + Sync {
    fn publish(&self, channels: &ChannelSet, event: &FeedEvent) -> Result<usize, FanoutError>;
}

/// Drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullFanout;

impl Fanout for NullFanout {
    fn publish(&self, _channels: &ChannelSet, _event: &FeedEvent) -> Result<usize, FanoutError> {
        Ok(0)
    }
}
