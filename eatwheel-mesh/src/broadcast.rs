//! Same-origin broadcast channel shared by the coordinator and every tab.
//!
//! One tokio broadcast channel per device. Posts are pre-encoded JSON, so a
//! message is serialized once no matter how many tabs listen. Each subscriber
//! buffers up to `capacity` posts; a tab that falls further behind skips the
//! oldest ones and reports the gap through [`BroadcastChannel::record_lagged`].
//!
//! Posters receive their own posts. Filtering by origin is the caller's job.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::error::ProtocolError;
use crate::relay::ChannelMessage;

/// Snapshot of channel health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub messages_posted: u64,
    /// Posts nobody was subscribed to receive.
    pub messages_unheard: u64,
    /// Posts skipped by lagging subscribers.
    pub messages_lagged: u64,
    pub subscribers: usize,
}

#[derive(Debug, Default)]
struct AtomicChannelStats {
    posted: AtomicU64,
    unheard: AtomicU64,
    lagged: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct BroadcastChannel {
    sender: broadcast::Sender<Arc<str>>,
    capacity: usize,
    stats: Arc<AtomicChannelStats>,
}

impl BroadcastChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            stats: Arc::new(AtomicChannelStats::default()),
        }
    }

    /// Encode and post. Returns how many subscribers will see it.
    pub fn post(&self, message: &ChannelMessage) -> Result<usize, ProtocolError> {
        Ok(self.post_raw(message.encode()?))
    }

    pub fn post_raw(&self, encoded: Arc<str>) -> usize {
        self.stats.posted.fetch_add(1, Ordering::Relaxed);
        match self.sender.send(encoded) {
            Ok(count) => count,
            Err(_) => {
                self.stats.unheard.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<str>> {
        self.sender.subscribe()
    }

    pub fn record_lagged(&self, skipped: u64) {
        self.stats.lagged.fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            messages_posted: self.stats.posted.load(Ordering::Relaxed),
            messages_unheard: self.stats.unheard.load(Ordering::Relaxed),
            messages_lagged: self.stats.lagged.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
