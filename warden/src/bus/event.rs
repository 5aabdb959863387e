//! Event, envelope, and policy types for the bus

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A published event
///
/// `type` always equals the topic the event was published to. Field names
/// are part of the external contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Event id, assigned at publish
    pub id: String,
    /// Topic name
    #[serde(rename = "type")]
    pub event_type: String,
    /// Publisher payload
    pub data: Value,
    /// Publish time, unix ms
    pub timestamp: i64,
    /// Caller-provided correlation id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Id of the event that caused this one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    /// Envelope format version
    pub version: u32,
}

impl Event {
    pub(crate) fn new(topic: &str, data: Value, timestamp: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type: topic.to_string(),
            data,
            timestamp,
            correlation_id: None,
            causation_id: None,
            version: 1,
        }
    }
}

/// Delivery envelope handed to subscription handlers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// The event being delivered
    pub event: Event,
    /// 1-based attempt counter
    pub attempt: u32,
    /// Unix ms of the first delivery attempt
    pub first_attempt_at: i64,
    /// Unix ms of the most recent delivery attempt
    pub last_attempt_at: i64,
    /// Subscription receiving the delivery
    pub subscriber_id: String,
}

/// Payload published to the dead-letter topic after retries are exhausted
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    /// The event whose delivery failed
    pub original_event: Event,
    /// Subscription that exhausted its retry budget
    pub subscription_id: String,
    /// Final error message
    pub error: String,
    /// Unix ms when the delivery was abandoned
    pub failed_at: i64,
}

/// Options accepted by `publish`
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Correlation id copied onto the event
    pub correlation_id: Option<String>,
    /// Causation id copied onto the event
    pub causation_id: Option<String>,
    /// Delay before the event enters the pipeline, in ms
    pub delay_ms: Option<u64>,
    /// Drop the event silently if not delivered within this many ms
    pub ttl_ms: Option<u64>,
}

/// Per-subscription retry policy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Total handler invocations before dead-lettering
    pub max_attempts: u32,
    /// Delay before the second attempt, in ms
    pub initial_delay_ms: u64,
    /// Upper bound on any retry delay, in ms
    pub max_delay_ms: u64,
    /// Multiplier applied per subsequent retry
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `failed_attempt + 1`
    ///
    /// `failed_attempt` is 1-based: after the first failed attempt the delay
    /// is `initial_delay_ms`, doubling (by default) per subsequent failure,
    /// capped at `max_delay_ms`.
    pub fn delay_after(&self, failed_attempt: u32) -> std::time::Duration {
        let exp = failed_attempt.saturating_sub(1);
        let raw = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exp as i32);
        let capped = raw.min(self.max_delay_ms as f64).max(0.0);
        std::time::Duration::from_millis(capped as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn event_serializes_type_field() {
        let event = Event::new("orders.created", json!({"n": 1}), 42);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "orders.created");
        assert_eq!(value["data"]["n"], 1);
        assert_eq!(value["timestamp"], 42);
        assert_eq!(value["version"], 1);
        assert!(value.get("correlationId").is_none());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let retry = RetryPolicy {
            max_attempts: 5,
            initial_delay_ms: 10,
            max_delay_ms: 100,
            backoff_multiplier: 2.0,
        };
        assert_eq!(retry.delay_after(1), Duration::from_millis(10));
        assert_eq!(retry.delay_after(2), Duration::from_millis(20));
        assert_eq!(retry.delay_after(3), Duration::from_millis(40));
        assert_eq!(retry.delay_after(5), Duration::from_millis(100));
    }

    #[test]
    fn dead_letter_payload_shape() {
        let event = Event::new("t", json!({"hello": "world"}), 1);
        let dl = DeadLetter {
            original_event: event,
            subscription_id: "sub-1".to_string(),
            error: "boom".to_string(),
            failed_at: 99,
        };
        let value = serde_json::to_value(&dl).unwrap();
        assert_eq!(value["originalEvent"]["data"]["hello"], "world");
        assert_eq!(value["subscriptionId"], "sub-1");
        assert_eq!(value["error"], "boom");
        assert_eq!(value["failedAt"], 99);
    }
}
