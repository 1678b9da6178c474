//! Retry Notification Hub
//!
//! Named publish/subscribe channels used to retry adapter bring-up once the
//! transport becomes available. Callbacks run synchronously on the notifying
//! thread under the hub's read lock, so they must not block and must not
//! call back into the hub.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Source tag this driver announces itself with
pub const DRIVER_TAG: &str = "relay-adapter";

pub type NotifyCallback = Arc<dyn Fn(&str) + Send + Sync>;

struct Subscriber {
    id: u64,
    name: String,
    callback: NotifyCallback,
}

/// Registration returned by [`NotificationHub::subscribe`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    channel: String,
    id: u64,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[derive(Default)]
pub struct NotificationHub {
    channels: RwLock<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` on `channel`. A second subscription by the same
    /// subscriber name returns the existing registration.
    pub fn subscribe(&self, channel: &str, subscriber: &str, callback: NotifyCallback) -> Subscription {
        let mut channels = self.channels.write();
        let entries = channels.entry(channel.to_string()).or_default();

        if let Some(existing) = entries.iter().find(|s| s.name == subscriber) {
            trace!(channel, subscriber, "Already subscribed");
            return Subscription {
                channel: channel.to_string(),
                id: existing.id,
            };
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        entries.push(Subscriber {
            id,
            name: subscriber.to_string(),
            callback,
        });
        debug!(channel, subscriber, "Subscribed");
        Subscription {
            channel: channel.to_string(),
            id,
        }
    }

    /// Returns whether the subscription was still registered
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let mut channels = self.channels.write();
        let Some(entries) = channels.get_mut(&subscription.channel) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|s| s.id != subscription.id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            channels.remove(&subscription.channel);
        }
        removed
    }

    /// Invoke every callback on `channel` with `source`. Returns how many ran.
    pub fn notify(&self, channel: &str, source: &str) -> usize {
        let channels = self.channels.read();
        let Some(entries) = channels.get(channel) else {
            return 0;
        };
        trace!(channel, source, subscribers = entries.len(), "Notify");
        for subscriber in entries {
            (subscriber.callback)(source);
        }
        entries.len()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.read().get(channel).map_or(0, |e| e.len())
    }
}
