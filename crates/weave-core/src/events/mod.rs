//! Message bus - durable publish/subscribe between the engine, agents and
//! the registry.
//!
//! Semantics:
//!   - `publish` acks once the event is appended to the `events` journal and
//!     handed to every live subscriber of its topic.
//!   - Delivery is at-least-once: re-publishing an event id is accepted and
//!     delivered again. Consumers de-duplicate on `eventId`.
//!   - Each subscriber owns one ordered channel, so events of a topic reach
//!     it in publish order, also when it listens to several topics.
//!   - A closed bus rejects publishes with a retriable `Unavailable` error.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::ServerError;
use crate::models::event::Event;
use crate::models::workflow::RetryPolicy;
use crate::store::EventStore;

const TAP_CAPACITY: usize = 1024;

struct Subscriber {
    topics: HashSet<String>,
    tx: mpsc::UnboundedSender<Event>,
}

struct EventBusInner {
    subscribers: HashMap<String, Subscriber>,
    closed: bool,
}

/// Thread-safe, journaled message bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<RwLock<EventBusInner>>,
    journal: EventStore,
    tap: broadcast::Sender<Event>,
}

/// Receiving half of a subscription. Dropping it unsubscribes lazily.
pub struct Subscription {
    handler_id: String,
    rx: mpsc::UnboundedReceiver<Event>,
}

impl Subscription {
    pub fn handler_id(&self) -> &str {
        &self.handler_id
    }

    /// Next event, or `None` once the bus closed or the subscription was
    /// replaced.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn into_stream(self) -> UnboundedReceiverStream<Event> {
        UnboundedReceiverStream::new(self.rx)
    }
}

impl EventBus {
    pub fn new(journal: EventStore) -> Self {
        let (tap, _) = broadcast::channel(TAP_CAPACITY);
        Self {
            inner: Arc::new(RwLock::new(EventBusInner {
                subscribers: HashMap::new(),
                closed: false,
            })),
            journal,
            tap,
        }
    }

    // ─── Publish ────────────────────────────────────────────────────────

    /// Journal the event, then deliver it to every subscriber of `topic`.
    pub async fn publish(&self, topic: &str, event: &Event) -> Result<(), ServerError> {
        if self.inner.read().await.closed {
            return Err(ServerError::Unavailable("message bus is closed".to_string()));
        }

        let first_copy = self
            .journal
            .append(topic, event)
            .await
            .map_err(|e| ServerError::Unavailable(format!("journal append failed: {}", e)))?;
        if !first_copy {
            tracing::debug!("[Bus] Redelivering event {} on {}", event.event_id, topic);
        }

        let mut inner = self.inner.write().await;
        if inner.closed {
            return Err(ServerError::Unavailable("message bus is closed".to_string()));
        }
        let mut gone = Vec::new();
        for (handler_id, sub) in inner.subscribers.iter() {
            if !sub.topics.contains(topic) {
                continue;
            }
            if sub.tx.send(event.clone()).is_err() {
                gone.push(handler_id.clone());
            }
        }
        for handler_id in gone {
            tracing::debug!("[Bus] Dropping detached subscriber {}", handler_id);
            inner.subscribers.remove(&handler_id);
        }
        drop(inner);

        // Nobody tapping is fine.
        let _ = self.tap.send(event.clone());
        Ok(())
    }

    /// Publish on the event's own topic.
    pub async fn emit(&self, event: &Event) -> Result<(), ServerError> {
        self.publish(event.topic(), event).await
    }

    /// Publish, retrying retriable failures with exponential backoff and
    /// jitter, up to `max_attempts` tries in total.
    pub async fn publish_with_retry(
        &self,
        topic: &str,
        event: &Event,
        max_attempts: u32,
        backoff: &RetryPolicy,
    ) -> Result<(), ServerError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.publish(topic, event).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retriable() && attempt < max_attempts => {
                    let wait = crate::engine::backoff::delay(backoff, attempt);
                    tracing::warn!(
                        "[Bus] Publish of {} on {} failed (attempt {}/{}), retrying in {:?}: {}",
                        event.event_id,
                        topic,
                        attempt,
                        max_attempts,
                        wait,
                        e
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ─── Subscribe ──────────────────────────────────────────────────────

    pub async fn subscribe(&self, topic: &str, handler_id: &str) -> Subscription {
        self.subscribe_many(&[topic], handler_id).await
    }

    /// One ordered stream over several topics. Re-using a handler id
    /// replaces that handler's previous subscription.
    pub async fn subscribe_many(&self, topics: &[&str], handler_id: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.write().await;
        if inner.closed {
            // Leave the receiver without a sender so it ends immediately.
            drop(tx);
        } else {
            let replaced = inner.subscribers.insert(
                handler_id.to_string(),
                Subscriber {
                    topics: topics.iter().map(|t| t.to_string()).collect(),
                    tx,
                },
            );
            if replaced.is_some() {
                tracing::debug!("[Bus] Handler {} re-subscribed", handler_id);
            }
        }
        Subscription {
            handler_id: handler_id.to_string(),
            rx,
        }
    }

    pub async fn unsubscribe(&self, handler_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        inner.subscribers.remove(handler_id).is_some()
    }

    /// Every published event, regardless of topic. Slow tappers lose events.
    pub fn tap(&self) -> broadcast::Receiver<Event> {
        self.tap.subscribe()
    }

    // ─── Journal & lifecycle ────────────────────────────────────────────

    /// Journaled events of a workflow in production order.
    pub async fn replay(&self, workflow_id: &str) -> Result<Vec<Event>, ServerError> {
        self.journal.list_by_workflow(workflow_id).await
    }

    /// Reject further publishes and end every subscription stream.
    pub async fn close(&self) {
        let mut inner = self.inner.write().await;
        inner.closed = true;
        inner.subscribers.clear();
        tracing::info!("[Bus] Closed");
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.read().await.closed
    }

    pub async fn subscriber_count(&self) -> usize {
        self.inner.read().await.subscribers.len()
    }
}

/// Receive with a deadline; `None` on timeout or closed subscription.
pub async fn recv_timeout(sub: &mut Subscription, timeout: Duration) -> Option<Event> {
    tokio::time::timeout(timeout, sub.recv()).await.ok().flatten()
}
