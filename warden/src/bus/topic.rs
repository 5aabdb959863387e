//! Topic state and retention

use std::collections::VecDeque;
use std::sync::{Mutex, RwLock};

use serde::{Deserialize, Serialize};

use super::event::Event;
use super::subscription::Subscription;
use std::sync::Arc;

/// Per-topic retention and fan-out settings
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopicSettings {
    /// Maximum retained events
    pub retain_count: usize,
    /// Maximum retained event age, in ms
    pub retain_duration_ms: i64,
    /// Maximum concurrent subscriptions
    pub max_subscribers: usize,
}

/// State for one topic
///
/// Retained events are an ordered sequence with O(1) head drop; the
/// subscription list is snapshotted for each delivery.
pub(crate) struct TopicState {
    pub(crate) name: String,
    pub(crate) settings: RwLock<TopicSettings>,
    pub(crate) retained: Mutex<VecDeque<Event>>,
    pub(crate) subscriptions: RwLock<Vec<Arc<Subscription>>>,
}

impl TopicState {
    pub(crate) fn new(name: &str, settings: TopicSettings) -> Self {
        Self {
            name: name.to_string(),
            settings: RwLock::new(settings),
            retained: Mutex::new(VecDeque::new()),
            subscriptions: RwLock::new(Vec::new()),
        }
    }

    /// Append an event to the retained tail, then trim by age and count
    pub(crate) fn retain(&self, event: Event, now_ms: i64) {
        let settings = *self.settings.read().unwrap_or_else(|e| e.into_inner());
        let mut retained = self.retained.lock().unwrap_or_else(|e| e.into_inner());
        retained.push_back(event);

        let min_timestamp = now_ms - settings.retain_duration_ms;
        while retained
            .front()
            .is_some_and(|e| e.timestamp < min_timestamp)
        {
            retained.pop_front();
        }
        while retained.len() > settings.retain_count {
            retained.pop_front();
        }
    }

    /// Snapshot of retained events in stored order
    pub(crate) fn retained_snapshot(&self) -> Vec<Event> {
        self.retained
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub(crate) fn clear_retained(&self) {
        self.retained
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Snapshot of subscriptions sorted by priority, highest first
    pub(crate) fn subscriber_snapshot(&self) -> Vec<Arc<Subscription>> {
        let mut subs: Vec<Arc<Subscription>> = self
            .subscriptions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect();
        subs.sort_by(|a, b| b.priority.cmp(&a.priority));
        subs
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub(crate) fn add_subscription(&self, sub: Arc<Subscription>) {
        self.subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(sub);
    }

    pub(crate) fn remove_subscription(&self, id: &str) {
        self.subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|s| s.id != id);
    }
}
