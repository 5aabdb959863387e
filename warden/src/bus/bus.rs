//! Topic-based pub/sub with retention, retry, and dead-lettering

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{Notify, Semaphore};
use tokio::task::AbortHandle;

use super::event::{DeadLetter, Envelope, Event, PublishOptions};
use super::middleware::{Middleware, Next, TailFn};
use super::subscription::{
    HandlerFn, StatCounters, SubscribeOptions, Subscription, SubscriptionStats,
};
use super::topic::{TopicSettings, TopicState};
use crate::clock::Clock;
use crate::config::BusConfig;
use crate::error::{BusError, Error, Result};

/// In-process event bus
///
/// Cloning is cheap; all clones share the same topics, subscriptions, and
/// pending queue. Delivery failures are retried per subscription and
/// dead-lettered when the budget is exhausted; they are never surfaced to
/// publishers.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    config: BusConfig,
    clock: Arc<dyn Clock>,
    topics: DashMap<String, Arc<TopicState>>,
    subscriptions: DashMap<String, Arc<Subscription>>,
    middleware: RwLock<Vec<Arc<dyn Middleware>>>,
    delayed: DashMap<String, AbortHandle>,
    inflight: AtomicUsize,
    idle: Notify,
}

/// Keeps the in-flight count accurate even when a task is aborted
struct InflightGuard {
    inner: Arc<BusInner>,
}

impl InflightGuard {
    fn new(inner: Arc<BusInner>) -> Self {
        inner.inflight.fetch_add(1, Ordering::SeqCst);
        Self { inner }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if self.inner.inflight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

impl EventBus {
    /// Create a bus; the reserved dead-letter topic exists from the start
    pub fn new(config: BusConfig, clock: Arc<dyn Clock>) -> Self {
        let inner = Arc::new(BusInner {
            config,
            clock,
            topics: DashMap::new(),
            subscriptions: DashMap::new(),
            middleware: RwLock::new(Vec::new()),
            delayed: DashMap::new(),
            inflight: AtomicUsize::new(0),
            idle: Notify::new(),
        });
        inner.ensure_topic(&inner.config.dead_letter_topic.clone());
        Self { inner }
    }

    /// Publish `data` to `topic`, returning the event id
    pub async fn publish(&self, topic: &str, data: Value) -> Result<String> {
        self.publish_with(topic, data, PublishOptions::default())
            .await
    }

    /// Publish with delivery options
    ///
    /// With a delay the event is queued and the id returned immediately;
    /// middleware runs at fire time and its failures are logged, not
    /// surfaced. Without a delay a middleware failure rejects the publish.
    pub async fn publish_with(
        &self,
        topic: &str,
        data: Value,
        options: PublishOptions,
    ) -> Result<String> {
        let now = self.inner.clock.now_ms();
        let mut event = Event::new(topic, data, now);
        event.correlation_id = options.correlation_id;
        event.causation_id = options.causation_id;
        let event_id = event.id.clone();

        self.inner.ensure_topic(topic);
        let deadline = options.ttl_ms.map(|ttl| now + ttl as i64);

        if let Some(delay) = options.delay_ms.filter(|d| *d > 0) {
            if self.inner.delayed.len() >= self.inner.config.max_queue_size {
                return Err(Error::Bus(BusError::QueueFull {
                    topic: topic.to_string(),
                    max: self.inner.config.max_queue_size,
                }));
            }
            let guard = InflightGuard::new(self.inner.clone());
            let inner = self.inner.clone();
            let task_id = event_id.clone();
            // The task waits for its abort handle to be registered before it
            // can fire, so the queue entry is never removed before insertion.
            let (registered_tx, registered_rx) = tokio::sync::oneshot::channel::<()>();
            let handle = tokio::spawn(async move {
                let _guard = guard;
                let _ = registered_rx.await;
                tokio::time::sleep(Duration::from_millis(delay)).await;
                inner.delayed.remove(&task_id);
                if let Err(e) = BusInner::process(inner.clone(), event, deadline).await {
                    tracing::warn!(error = %e, "middleware rejected delayed event");
                }
            });
            self.inner.delayed.insert(event_id.clone(), handle.abort_handle());
            let _ = registered_tx.send(());
            return Ok(event_id);
        }

        BusInner::process(self.inner.clone(), event, deadline)
            .await
            .map_err(|e| Error::Bus(BusError::Middleware(e.to_string())))?;
        Ok(event_id)
    }

    /// Subscribe `handler` to `topic`, returning the subscription id
    ///
    /// With `start_from_now = false` the topic's retained events are
    /// delivered in stored order before this call returns.
    pub async fn subscribe(
        &self,
        topic: &str,
        handler: HandlerFn,
        options: SubscribeOptions,
    ) -> Result<String> {
        let topic_state = self.inner.ensure_topic(topic);
        let settings = *topic_state
            .settings
            .read()
            .unwrap_or_else(|e| e.into_inner());
        if topic_state.subscriber_count() >= settings.max_subscribers {
            return Err(Error::Bus(BusError::SubscriberLimit {
                topic: topic.to_string(),
                max: settings.max_subscribers,
            }));
        }

        let concurrency = if options.sequential {
            1
        } else if options.concurrency == 0 {
            self.inner.config.default_concurrency
        } else {
            options.concurrency
        };

        let sub = Arc::new(Subscription {
            id: uuid::Uuid::new_v4().to_string(),
            topic: topic.to_string(),
            handler,
            filter: options.filter,
            priority: options.priority,
            sequential: options.sequential,
            timeout_ms: options
                .timeout_ms
                .unwrap_or(self.inner.config.default_timeout_ms),
            retry: options.retry,
            dead_letter_topic: options.dead_letter_topic,
            permits: Arc::new(Semaphore::new(concurrency)),
            active: std::sync::atomic::AtomicBool::new(true),
            stats: StatCounters::default(),
        });

        let backfill = if options.start_from_now {
            Vec::new()
        } else {
            topic_state.retained_snapshot()
        };

        topic_state.add_subscription(sub.clone());
        self.inner.subscriptions.insert(sub.id.clone(), sub.clone());

        if !backfill.is_empty() {
            // Replay under a single permit so retained events cannot
            // interleave with each other or with live deliveries.
            let permit = sub
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| Error::Internal("subscription permits closed".to_string()))?;
            for event in backfill {
                if !sub.is_active() {
                    break;
                }
                sub.stats.received.fetch_add(1, Ordering::SeqCst);
                if let Some(ref filter) = sub.filter {
                    if !filter(&event) {
                        continue;
                    }
                }
                let envelope = self.inner.envelope(&sub, event);
                BusInner::attempt_delivery(self.inner.clone(), sub.clone(), envelope).await;
            }
            drop(permit);
        }

        Ok(sub.id.clone())
    }

    /// Remove a subscription
    pub async fn unsubscribe(&self, id: &str) -> Result<()> {
        let Some((_, sub)) = self.inner.subscriptions.remove(id) else {
            return Err(Error::Bus(BusError::UnknownSubscription(id.to_string())));
        };
        sub.deactivate();
        if let Some(topic) = self.inner.topics.get(&sub.topic) {
            topic.remove_subscription(id);
        }
        Ok(())
    }

    /// Append a middleware to the chain
    pub fn use_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.inner
            .middleware
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(middleware);
    }

    /// Create or reconfigure a topic
    pub fn configure_topic(&self, name: &str, settings: TopicSettings) {
        let topic = self.inner.ensure_topic(name);
        *topic.settings.write().unwrap_or_else(|e| e.into_inner()) = settings;
    }

    /// Settings for `name`, if the topic exists
    pub fn topic_settings(&self, name: &str) -> Option<TopicSettings> {
        self.inner
            .topics
            .get(name)
            .map(|t| *t.settings.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Delete a topic and its subscriptions
    ///
    /// The reserved dead-letter topic cannot be deleted.
    pub fn delete_topic(&self, name: &str) -> Result<()> {
        if name == self.inner.config.dead_letter_topic {
            return Err(Error::Bus(BusError::ReservedTopic {
                topic: name.to_string(),
            }));
        }
        if let Some((_, topic)) = self.inner.topics.remove(name) {
            for sub in topic.subscriber_snapshot() {
                sub.deactivate();
                self.inner.subscriptions.remove(&sub.id);
            }
        }
        Ok(())
    }

    /// Retained events of `topic` in stored order
    pub fn retained(&self, topic: &str) -> Vec<Event> {
        self.inner
            .topics
            .get(topic)
            .map(|t| t.retained_snapshot())
            .unwrap_or_default()
    }

    /// Counter snapshot for a subscription
    pub fn subscription_stats(&self, id: &str) -> Option<SubscriptionStats> {
        self.inner.subscriptions.get(id).map(|s| s.stats_snapshot())
    }

    /// Number of queued delayed events
    pub fn pending_delayed(&self) -> usize {
        self.inner.delayed.len()
    }

    /// Resolve once no delivery is in flight and no delayed event is queued
    pub async fn drain(&self) {
        loop {
            if self.inner.inflight.load(Ordering::SeqCst) == 0 && self.inner.delayed.is_empty() {
                return;
            }
            let notified = self.inner.idle.notified();
            if self.inner.inflight.load(Ordering::SeqCst) == 0 && self.inner.delayed.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Drop pending delayed events, all non-dead-letter subscriptions, and
    /// retained events outside the dead-letter topic
    pub async fn clear(&self) {
        let delayed_ids: Vec<String> = self
            .inner
            .delayed
            .iter()
            .map(|e| e.key().clone())
            .collect();
        for id in delayed_ids {
            if let Some((_, handle)) = self.inner.delayed.remove(&id) {
                handle.abort();
            }
        }

        let dlq = self.inner.config.dead_letter_topic.clone();
        let sub_ids: Vec<String> = self
            .inner
            .subscriptions
            .iter()
            .filter(|e| e.value().topic != dlq)
            .map(|e| e.key().clone())
            .collect();
        for id in sub_ids {
            if let Some((_, sub)) = self.inner.subscriptions.remove(&id) {
                sub.deactivate();
                if let Some(topic) = self.inner.topics.get(&sub.topic) {
                    topic.remove_subscription(&id);
                }
            }
        }

        for topic in self.inner.topics.iter() {
            if topic.key() != &dlq {
                topic.clear_retained();
            }
        }
    }
}

impl BusInner {
    fn ensure_topic(&self, name: &str) -> Arc<TopicState> {
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(TopicState::new(
                    name,
                    TopicSettings {
                        retain_count: self.config.default_retain_count,
                        retain_duration_ms: self.config.default_retain_duration_ms,
                        max_subscribers: self.config.default_max_subscribers,
                    },
                ))
            })
            .clone()
    }

    fn envelope(&self, sub: &Subscription, event: Event) -> Envelope {
        let now = self.clock.now_ms();
        Envelope {
            event,
            attempt: 1,
            first_attempt_at: now,
            last_attempt_at: now,
            subscriber_id: sub.id.clone(),
        }
    }

    async fn process(
        inner: Arc<Self>,
        event: Event,
        deadline: Option<i64>,
    ) -> anyhow::Result<()> {
        if let Some(deadline) = deadline {
            if inner.clock.now_ms() > deadline {
                tracing::debug!(event = %event.id, topic = %event.event_type, "ttl elapsed, dropping");
                return Ok(());
            }
        }

        let chain: Vec<Arc<dyn Middleware>> = inner
            .middleware
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let tail_inner = inner.clone();
        let tail = move |event: Event| -> BoxFuture<'static, anyhow::Result<()>> {
            let inner = tail_inner.clone();
            Box::pin(async move {
                inner.retain_and_deliver(event);
                Ok(())
            })
        };
        let tail_ref: &TailFn = &tail;

        Next {
            chain: &chain,
            tail: tail_ref,
        }
        .run(event)
        .await
    }

    /// Chain tail: retain per topic policy, then fan out to subscribers
    fn retain_and_deliver(self: &Arc<Self>, event: Event) {
        let topic = self.ensure_topic(&event.event_type);
        topic.retain(event.clone(), self.clock.now_ms());

        for sub in topic.subscriber_snapshot() {
            sub.stats.received.fetch_add(1, Ordering::SeqCst);
            if !sub.is_active() {
                continue;
            }
            if let Some(ref filter) = sub.filter {
                if !filter(&event) {
                    continue;
                }
            }

            let envelope = self.envelope(&sub, event.clone());
            let guard = InflightGuard::new(self.clone());
            let inner = self.clone();
            tokio::spawn(async move {
                let _guard = guard;
                let Ok(permit) = sub.permits.clone().acquire_owned().await else {
                    return;
                };
                let _permit = permit;
                Self::attempt_delivery(inner, sub, envelope).await;
            });
        }
    }

    /// Run the full delivery cycle for one envelope: attempts, backoff, and
    /// dead-lettering once the budget is exhausted
    async fn attempt_delivery(inner: Arc<Self>, sub: Arc<Subscription>, mut envelope: Envelope) {
        loop {
            if !sub.is_active() {
                return;
            }
            envelope.last_attempt_at = inner.clock.now_ms();

            let outcome = tokio::time::timeout(
                Duration::from_millis(sub.timeout_ms),
                (sub.handler)(envelope.clone()),
            )
            .await;

            let error = match outcome {
                Ok(Ok(())) => {
                    sub.stats.processed.fetch_add(1, Ordering::SeqCst);
                    return;
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("handler timed out after {}ms", sub.timeout_ms),
            };
            sub.stats.failed.fetch_add(1, Ordering::SeqCst);

            if envelope.attempt < sub.retry.max_attempts {
                let delay = sub.retry.delay_after(envelope.attempt);
                tracing::debug!(
                    subscription = %sub.id,
                    topic = %sub.topic,
                    attempt = envelope.attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "delivery failed, retrying"
                );
                envelope.attempt += 1;
                tokio::time::sleep(delay).await;
                continue;
            }

            tracing::warn!(
                subscription = %sub.id,
                topic = %sub.topic,
                attempts = envelope.attempt,
                error = %error,
                "delivery failed, dead-lettering"
            );
            sub.stats.dead_lettered.fetch_add(1, Ordering::SeqCst);
            inner.dead_letter(&sub, envelope, error);
            return;
        }
    }

    /// Publish a dead-letter record; bypasses the middleware chain so a
    /// failing middleware cannot lose the record
    fn dead_letter(self: &Arc<Self>, sub: &Subscription, envelope: Envelope, error: String) {
        let now = self.clock.now_ms();
        let target = sub
            .dead_letter_topic
            .clone()
            .unwrap_or_else(|| self.config.dead_letter_topic.clone());

        let payload = DeadLetter {
            original_event: envelope.event.clone(),
            subscription_id: sub.id.clone(),
            error,
            failed_at: now,
        };
        let payload = match serde_json::to_value(&payload) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize dead-letter payload");
                return;
            }
        };

        let mut event = Event::new(&target, payload, now);
        event.causation_id = Some(envelope.event.id.clone());
        self.retain_and_deliver(event);
    }
}
