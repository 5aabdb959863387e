//! Subscription state and statistics

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use super::event::{Envelope, Event, RetryPolicy};

/// Async handler invoked per delivery
pub type HandlerFn =
    Arc<dyn Fn(Envelope) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Predicate deciding whether a subscription sees an event
pub type FilterFn = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Options accepted by `subscribe`
#[derive(Clone)]
pub struct SubscribeOptions {
    /// Drop events the predicate rejects
    pub filter: Option<FilterFn>,
    /// Delivery order across subscriptions of a topic, higher first
    pub priority: i32,
    /// Serialize deliveries within this subscription
    pub sequential: bool,
    /// Concurrent deliveries allowed when not sequential; 0 uses the bus default
    pub concurrency: usize,
    /// Handler timeout in ms; None uses the bus default
    pub timeout_ms: Option<u64>,
    /// Retry policy for failed deliveries
    pub retry: RetryPolicy,
    /// Override the dead-letter topic for this subscription
    pub dead_letter_topic: Option<String>,
    /// When false, replay retained events at subscription time
    pub start_from_now: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            filter: None,
            priority: 0,
            sequential: false,
            concurrency: 0,
            timeout_ms: None,
            retry: RetryPolicy::default(),
            dead_letter_topic: None,
            start_from_now: true,
        }
    }
}

/// Counters kept per subscription
#[derive(Debug, Default)]
pub(crate) struct StatCounters {
    pub(crate) received: AtomicU64,
    pub(crate) processed: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) dead_lettered: AtomicU64,
}

/// Point-in-time snapshot of a subscription's counters
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Events seen, including filtered ones
    pub received: u64,
    /// Deliveries that succeeded
    pub processed: u64,
    /// Individual attempts that failed
    pub failed: u64,
    /// Events abandoned to the dead-letter topic
    pub dead_lettered: u64,
}

/// An active subscription
pub(crate) struct Subscription {
    pub(crate) id: String,
    pub(crate) topic: String,
    pub(crate) handler: HandlerFn,
    pub(crate) filter: Option<FilterFn>,
    pub(crate) priority: i32,
    pub(crate) sequential: bool,
    pub(crate) timeout_ms: u64,
    pub(crate) retry: RetryPolicy,
    pub(crate) dead_letter_topic: Option<String>,
    /// One permit when sequential, `concurrency` permits otherwise
    pub(crate) permits: Arc<Semaphore>,
    pub(crate) active: AtomicBool,
    pub(crate) stats: StatCounters,
}

impl Subscription {
    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub(crate) fn stats_snapshot(&self) -> SubscriptionStats {
        SubscriptionStats {
            received: self.stats.received.load(Ordering::SeqCst),
            processed: self.stats.processed.load(Ordering::SeqCst),
            failed: self.stats.failed.load(Ordering::SeqCst),
            dead_lettered: self.stats.dead_lettered.load(Ordering::SeqCst),
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("priority", &self.priority)
            .field("sequential", &self.sequential)
            .field("timeout_ms", &self.timeout_ms)
            .field("active", &self.is_active())
            .finish()
    }
}
