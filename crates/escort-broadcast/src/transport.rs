//! The real-time transport boundary

use crate::error::TransportError;
use crate::topic::Topic;
use async_trait::async_trait;
use escort_model::WalkPayload;
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Callback invoked for every payload published after subscription
pub type PayloadHandler = Arc<dyn Fn(WalkPayload) + Send + Sync>;

/// Publish/subscribe transport keyed by [`Topic`]
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Deliver `payload` to current subscribers of `topic`
    ///
    /// Returns the number of subscribers it was handed to. Zero subscribers
    /// is not an error.
    async fn publish(&self, topic: &Topic, payload: WalkPayload) -> Result<usize, TransportError>;

    /// Register `handler` for payloads published from now on
    ///
    /// # Errors
    /// Setup failures are surfaced: a watcher without a subscription has no
    /// data source.
    async fn subscribe(
        &self,
        topic: &Topic,
        handler: PayloadHandler,
    ) -> Result<Subscription, TransportError>;
}

/// Unsubscribe handle
///
/// [`Subscription::unsubscribe`] stops delivery and releases the delivery
/// task. Dropping the handle does the same.
pub struct Subscription {
    topic: Topic,
    active: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Wrap a delivery task; `active` gates every handler call
    #[must_use]
    pub fn new(topic: Topic, active: Arc<AtomicBool>, task: JoinHandle<()>) -> Self {
        Self {
            topic,
            active,
            task: Some(task),
        }
    }

    /// Subscribed topic
    #[inline]
    #[must_use]
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Whether the handler can still be invoked
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) && self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop receiving and release the delivery task
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        self.active.store(false, Ordering::Release);
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::debug!(topic = %self.topic, "unsubscribed");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("active", &self.active.load(Ordering::Relaxed))
            .finish()
    }
}
