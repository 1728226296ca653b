//! Topic → subscriber mapping for inbound dispatch.
//!
//! The registry is the sole owner of subscriber lists; every add, remove,
//! and fanout happens under its lock. Delivery order within a topic is
//! registration order unless a subscription carries a priority, in which
//! case higher priorities are delivered first. One subscriber failing or
//! panicking never blocks delivery to the rest.

use crate::envelope::Envelope;
use crate::Result;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Invoked with each envelope delivered to the subscription.
pub type Subscriber = Arc<dyn Fn(&Envelope) -> Result<()> + Send + Sync>;
/// Evaluated before invocation; a `false` result skips delivery silently.
pub type Filter = Arc<dyn Fn(&Envelope) -> bool + Send + Sync>;

/// Token identifying one subscription; pass to `unsubscribe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    topic: String,
    id: u64,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[derive(Default)]
pub struct SubscribeOptions {
    pub filter: Option<Filter>,
    pub priority: i32,
}

#[derive(Clone)]
struct Entry {
    id: u64,
    priority: i32,
    filter: Option<Filter>,
    subscriber: Subscriber,
}

/// Thread-safe topic → ordered subscriber set.
pub struct SubscriptionRegistry {
    topics: RwLock<HashMap<String, Vec<Entry>>>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self, topic: impl Into<String>, subscriber: Subscriber) -> SubscriptionHandle {
        self.subscribe_with(topic, subscriber, SubscribeOptions::default())
    }

    pub fn subscribe_with(
        &self,
        topic: impl Into<String>,
        subscriber: Subscriber,
        options: SubscribeOptions,
    ) -> SubscriptionHandle {
        let topic = topic.into();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let entry = Entry {
            id,
            priority: options.priority,
            filter: options.filter,
            subscriber,
        };

        let mut topics = self.topics.write();
        let entries = topics.entry(topic.clone()).or_default();
        entries.push(entry);
        // Higher priority first; registration order (monotonic id) within a
        // priority level. The sort is stable so equal keys keep their order.
        entries.sort_by_key(|e| (std::cmp::Reverse(e.priority), e.id));

        SubscriptionHandle { topic, id }
    }

    /// Remove one subscription. Returns false when the handle is stale.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let mut topics = self.topics.write();
        let Some(entries) = topics.get_mut(&handle.topic) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|e| e.id != handle.id);
        let removed = entries.len() < before;
        if entries.is_empty() {
            topics.remove(&handle.topic);
        }
        removed
    }

    /// Drop every subscription (connection manager teardown).
    pub fn clear(&self) {
        self.topics.write().clear();
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.read().get(topic).map_or(0, Vec::len)
    }

    /// Fan an envelope out to every matching subscriber for its topic.
    ///
    /// Returns how many subscribers were invoked, counting ones whose
    /// callback failed or panicked (logged and skipped); filter rejections
    /// are silent and not counted.
    pub fn dispatch(&self, envelope: &Envelope) -> usize {
        // Snapshot under the read lock, invoke outside it, so subscribers
        // may themselves subscribe/unsubscribe.
        let entries: Vec<Entry> = {
            let topics = self.topics.read();
            match topics.get(&envelope.topic) {
                Some(entries) => entries.clone(),
                None => return 0,
            }
        };

        let mut invoked = 0;
        for entry in &entries {
            if let Some(filter) = &entry.filter {
                if !filter(envelope) {
                    continue;
                }
            }
            let outcome = catch_unwind(AssertUnwindSafe(|| (entry.subscriber)(envelope)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(topic = %envelope.topic, subscription_id = entry.id, error = %e,
                        "subscriber returned error");
                }
                Err(_) => {
                    warn!(topic = %envelope.topic, subscription_id = entry.id,
                        "subscriber panicked");
                }
            }
            invoked += 1;
        }
        invoked
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
