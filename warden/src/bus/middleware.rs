//! Publish middleware chain
//!
//! Middlewares run in registration order between `publish` and
//! retention/delivery. A middleware may transform the event before calling
//! `next`, short-circuit by not calling `next`, or wrap `next` for error
//! handling. An error returned before the chain tail completes rejects the
//! publish; handler failures never reach the chain (they go through retry
//! and the dead-letter topic).

use async_trait::async_trait;
use futures::future::BoxFuture;

use super::event::Event;

/// Terminal stage of the chain: retention plus delivery fan-out
pub(crate) type TailFn =
    dyn Fn(Event) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

/// Remainder of the middleware chain
pub struct Next<'a> {
    pub(crate) chain: &'a [std::sync::Arc<dyn Middleware>],
    pub(crate) tail: &'a TailFn,
}

impl Next<'_> {
    /// Run the rest of the chain with `event`
    pub async fn run(self, event: Event) -> anyhow::Result<()> {
        match self.chain.split_first() {
            Some((head, rest)) => {
                head.handle(
                    event,
                    Next {
                        chain: rest,
                        tail: self.tail,
                    },
                )
                .await
            }
            None => (self.tail)(event).await,
        }
    }
}

/// A stage in the publish pipeline
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Process `event`, usually forwarding it via `next.run(event)`
    async fn handle(&self, event: Event, next: Next<'_>) -> anyhow::Result<()>;
}
