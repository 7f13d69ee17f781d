// src/feed.rs
//! In-process change feed.
//!
//! Row-level change events are published per poll and per table. A consumer
//! subscribes with a [`SubscriptionKey`] and receives a [`Subscription`] guard;
//! dropping the guard releases the channel, and the channel itself is removed
//! once its last subscriber is gone.
//!
//! Events for a key are delivered in publish order. The feed may be marked
//! unavailable (for example while the database listener reconnects); doing so
//! closes every open channel so that subscribers notice the outage.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 256;

/// Default bound on distinct open keys.
pub const DEFAULT_MAX_CHANNELS: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Votes,
    PollOptions,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Votes => "votes",
            Table::PollOptions => "poll_options",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row-level change notification.
///
/// Row images are kept as raw JSON: the feed does not guarantee that an old
/// row carries more than its primary key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub table: Table,
    pub poll_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_row: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_row: Option<Value>,
}

impl ChangeEvent {
    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey::new(self.poll_id, self.table)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub poll_id: Uuid,
    pub table: Table,
}

impl SubscriptionKey {
    pub fn new(poll_id: Uuid, table: Table) -> Self {
        Self { poll_id, table }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.table, self.poll_id)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FeedError {
    #[error("change feed unavailable")]
    Unavailable,

    #[error("change feed is at its limit of {limit} open channels")]
    TooManyChannels { limit: usize },
}

struct Channel {
    id: u64,
    sender: broadcast::Sender<ChangeEvent>,
}

type Channels = HashMap<SubscriptionKey, Channel>;

struct FeedInner {
    channels: Mutex<Channels>,
    available: AtomicBool,
    next_channel_id: AtomicU64,
    max_channels: usize,
}

impl FeedInner {
    fn channels(&self) -> MutexGuard<'_, Channels> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Registry of per-(poll, table) broadcast channels.
#[derive(Clone)]
pub struct ChangeFeed {
    inner: Arc<FeedInner>,
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeFeed {
    /// Creates an available feed.
    pub fn new() -> Self {
        Self::with_max_channels(DEFAULT_MAX_CHANNELS)
    }

    /// Creates an available feed that keeps at most `max_channels` keys open.
    pub fn with_max_channels(max_channels: usize) -> Self {
        let inner = FeedInner {
            channels: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            next_channel_id: AtomicU64::new(0),
            max_channels,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }

    /// Marks the feed up or down. Going down closes all open channels.
    pub fn set_available(&self, available: bool) {
        let was = self.inner.available.swap(available, Ordering::SeqCst);
        if was && !available {
            let dropped = {
                let mut channels = self.inner.channels();
                let count = channels.len();
                channels.clear();
                count
            };
            info!(channels = dropped, "Change feed unavailable, closed open channels");
        } else if !was && available {
            info!("Change feed available");
        }
    }

    pub fn subscribe(&self, key: SubscriptionKey) -> Result<Subscription, FeedError> {
        if !self.is_available() {
            return Err(FeedError::Unavailable);
        }

        let (channel_id, receiver) = {
            let mut channels = self.inner.channels();
            let limit = self.inner.max_channels;
            if !channels.contains_key(&key) && channels.len() >= limit {
                warn!(key = %key, limit, "Change feed channel limit reached");
                return Err(FeedError::TooManyChannels { limit });
            }
            let channel = channels.entry(key).or_insert_with(|| Channel {
                id: self.inner.next_channel_id.fetch_add(1, Ordering::Relaxed),
                sender: broadcast::channel(CHANNEL_CAPACITY).0,
            });
            (channel.id, channel.sender.subscribe())
        };
        debug!(key = %key, "Subscribed to change feed");

        Ok(Subscription {
            key,
            channel_id,
            receiver,
            feed: Arc::clone(&self.inner),
        })
    }

    /// Delivers an event to the subscribers of its key. Returns how many
    /// subscribers received it.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        let key = event.key();
        let sender = self
            .inner
            .channels()
            .get(&key)
            .map(|channel| channel.sender.clone());
        match sender {
            Some(sender) => sender.send(event).unwrap_or(0),
            None => 0,
        }
    }

    /// Number of keys that currently have an open channel.
    pub fn open_channels(&self) -> usize {
        self.inner.channels().len()
    }
}

/// A scoped subscription to one key. Released on drop.
pub struct Subscription {
    key: SubscriptionKey,
    channel_id: u64,
    receiver: broadcast::Receiver<ChangeEvent>,
    feed: Arc<FeedInner>,
}

impl Subscription {
    pub fn key(&self) -> SubscriptionKey {
        self.key
    }

    pub async fn recv(&mut self) -> Result<ChangeEvent, broadcast::error::RecvError> {
        self.receiver.recv().await
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("key", &self.key).finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut channels = self.feed.channels();
        let last = match channels.get(&self.key) {
            // Our own receiver is still alive at this point.
            Some(channel) if channel.id == self.channel_id => channel.sender.receiver_count() <= 1,
            _ => false,
        };
        if last {
            channels.remove(&self.key);
        }
        debug!(key = %self.key, released_channel = last, "Released change feed subscription");
    }
}
