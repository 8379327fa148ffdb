//! In-process broadcast hub
//!
//! One `tokio::sync::broadcast` channel per topic, created on first
//! subscription and pruned once its last subscriber is gone. Every
//! subscription gets its own delivery task, which keeps per-subscriber FIFO
//! order and isolates a slow handler from the others.

use crate::error::TransportError;
use crate::topic::Topic;
use crate::transport::{PayloadHandler, Subscription, Transport};
use async_trait::async_trait;
use dashmap::DashMap;
use escort_model::WalkPayload;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

/// Default per-topic buffer
pub const DEFAULT_CAPACITY: usize = 256;

/// Topic registry and fan-out
#[derive(Debug)]
pub struct BroadcastHub {
    /// Per-topic buffer; a subscriber that falls further behind skips ahead
    capacity: usize,
    topics: DashMap<Topic, broadcast::Sender<WalkPayload>>,
    closed: AtomicBool,
}

impl BroadcastHub {
    /// Create a hub with the given per-topic buffer
    #[inline]
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Current subscriber count for a topic
    #[must_use]
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.topics
            .get(topic)
            .map_or(0, |tx| tx.receiver_count())
    }

    /// Number of live topics
    #[inline]
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// Close the hub: further calls fail and delivery tasks wind down
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.topics.clear();
        debug!("broadcast hub shut down");
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl Transport for BroadcastHub {
    async fn publish(&self, topic: &Topic, payload: WalkPayload) -> Result<usize, TransportError> {
        self.ensure_open()?;

        let kind = payload.kind();
        let sent = match self.topics.get(topic) {
            Some(tx) => tx.send(payload).unwrap_or(0),
            None => 0,
        };

        if sent == 0 {
            // Last subscriber left since the previous publish
            self.topics.remove_if(topic, |_, tx| tx.receiver_count() == 0);
        }
        debug!(%topic, kind, subscribers = sent, "published");
        Ok(sent)
    }

    async fn subscribe(
        &self,
        topic: &Topic,
        handler: PayloadHandler,
    ) -> Result<Subscription, TransportError> {
        self.ensure_open()?;

        let mut rx = self
            .topics
            .entry(topic.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        let active = Arc::new(AtomicBool::new(true));
        let gate = Arc::clone(&active);
        let name = topic.clone();

        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => {
                        if !gate.load(Ordering::Acquire) {
                            break;
                        }
                        handler(payload);
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(topic = %name, missed, "subscriber lagged; payloads dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        debug!(%topic, "subscribed");
        Ok(Subscription::new(topic.clone(), active, task))
    }
}
