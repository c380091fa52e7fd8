//! Message broker port and the in-memory implementation.
//!
//! The engine runs off two durable queues with manual acknowledgement:
//! a message stays invisible while a consumer holds it, returns to the
//! queue on `nack`, and moves to the queue's dead-letter target once its
//! delivery count exceeds the configured limit. Delayed publish is
//! broker-native so retry backoff does not depend on in-process timers.
//!
//! [`InMemoryBroker`] implements the contract without durability for tests
//! and embedded deployments; the SQLite broker in weft-infra is the
//! durable one.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;
use uuid::Uuid;

use weft_types::error::QueueError;
use weft_types::queue::DEAD_LETTER_SUFFIX;

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

/// One message leased to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Broker-assigned message id.
    pub id: Uuid,
    /// Queue the message was received from.
    pub queue: String,
    /// Message payload.
    pub payload: Value,
    /// How many times this message has been delivered, this one included.
    pub delivery_count: u32,
}

/// Durable queue operations the engine depends on.
pub trait MessageBroker: Send + Sync {
    /// Publish a message, optionally with scheduled (delayed) delivery.
    fn publish(
        &self,
        queue: &str,
        payload: &Value,
        delay: Option<Duration>,
    ) -> impl std::future::Future<Output = Result<(), QueueError>> + Send;

    /// Lease the next available message, if any. The message stays
    /// invisible to other consumers until acked or nacked.
    fn receive(
        &self,
        queue: &str,
    ) -> impl std::future::Future<Output = Result<Option<Delivery>, QueueError>> + Send;

    /// Acknowledge a delivery, removing the message permanently.
    fn ack(
        &self,
        delivery: &Delivery,
    ) -> impl std::future::Future<Output = Result<(), QueueError>> + Send;

    /// Reject a delivery. The message returns to its queue, or moves to the
    /// dead-letter target once the delivery limit is reached.
    fn nack(
        &self,
        delivery: &Delivery,
    ) -> impl std::future::Future<Output = Result<(), QueueError>> + Send;
}

// ---------------------------------------------------------------------------
// InMemoryBroker
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct QueuedMessage {
    id: Uuid,
    payload: Value,
    available_at: Instant,
    delivery_count: u32,
    inflight: bool,
}

/// Non-durable broker for tests and embedded use.
pub struct InMemoryBroker {
    queues: Mutex<HashMap<String, Vec<QueuedMessage>>>,
    delivery_limit: u32,
}

impl InMemoryBroker {
    /// Create a broker with the given dead-letter delivery limit.
    pub fn new(delivery_limit: u32) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            delivery_limit: delivery_limit.max(1),
        }
    }

    /// Number of messages currently sitting in a queue (leased included).
    pub fn depth(&self, queue: &str) -> usize {
        let queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues.get(queue).map_or(0, Vec::len)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(5)
    }
}

impl MessageBroker for InMemoryBroker {
    async fn publish(
        &self,
        queue: &str,
        payload: &Value,
        delay: Option<Duration>,
    ) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues
            .entry(queue.to_string())
            .or_default()
            .push(QueuedMessage {
                id: Uuid::now_v7(),
                payload: payload.clone(),
                available_at: Instant::now() + delay.unwrap_or(Duration::ZERO),
                delivery_count: 0,
                inflight: false,
            });
        Ok(())
    }

    async fn receive(&self, queue: &str) -> Result<Option<Delivery>, QueueError> {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        let Some(messages) = queues.get_mut(queue) else {
            return Ok(None);
        };

        let now = Instant::now();
        let candidate = messages
            .iter_mut()
            .filter(|m| !m.inflight && m.available_at <= now)
            .min_by_key(|m| m.available_at);

        Ok(candidate.map(|message| {
            message.inflight = true;
            message.delivery_count += 1;
            Delivery {
                id: message.id,
                queue: queue.to_string(),
                payload: message.payload.clone(),
                delivery_count: message.delivery_count,
            }
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(messages) = queues.get_mut(&delivery.queue) {
            messages.retain(|m| m.id != delivery.id);
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        let Some(messages) = queues.get_mut(&delivery.queue) else {
            return Ok(());
        };
        let Some(position) = messages.iter().position(|m| m.id == delivery.id) else {
            return Ok(());
        };

        if messages[position].delivery_count >= self.delivery_limit {
            let mut message = messages.remove(position);
            tracing::warn!(
                queue = delivery.queue.as_str(),
                message_id = %message.id,
                deliveries = message.delivery_count,
                "delivery limit reached, routing to dead letter queue"
            );
            message.inflight = false;
            queues
                .entry(format!("{}{DEAD_LETTER_SUFFIX}", delivery.queue))
                .or_default()
                .push(message);
        } else {
            messages[position].inflight = false;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
