//! Topic-based event bus
//!
//! Pub/sub with retained events, priority-ordered fan-out, per-subscription
//! retry with exponential backoff, a middleware chain on the publish path,
//! and a reserved dead-letter topic for deliveries that exhaust their retry
//! budget.

mod bus;
mod event;
mod middleware;
mod subscription;
mod topic;

pub use bus::EventBus;
pub use event::{DeadLetter, Envelope, Event, PublishOptions, RetryPolicy};
pub use middleware::{Middleware, Next};
pub use subscription::{FilterFn, HandlerFn, SubscribeOptions, SubscriptionStats};
pub use topic::TopicSettings;
