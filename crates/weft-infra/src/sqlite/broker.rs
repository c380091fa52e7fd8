//! SQLite-backed durable message broker.
//!
//! Queue messages live in the `queue_messages` table. `available_at`
//! implements scheduled delivery (retry backoff survives restart because
//! the delay is data, not a timer), and `locked_until` is the consumer
//! lease: a received message is invisible until acked, nacked, or the
//! lease expires and the broker redelivers it.
//!
//! The claim in `receive` is a single conditional UPDATE .. RETURNING, so
//! concurrent consumers on the single-writer pool cannot lease the same
//! message twice.

use std::time::Duration;

use chrono::Utc;
use sqlx::Row;
use uuid::Uuid;

use weft_core::broker::{Delivery, MessageBroker};
use weft_types::error::QueueError;
use weft_types::queue::DEAD_LETTER_SUFFIX;

use super::pool::DatabasePool;
use super::{format_datetime, parse_uuid};

/// Durable SQLite implementation of `MessageBroker`.
pub struct SqliteBroker {
    pool: DatabasePool,
    lease: Duration,
    delivery_limit: u32,
}

impl SqliteBroker {
    /// Create a broker with the given consumer lease and dead-letter
    /// delivery limit.
    pub fn new(pool: DatabasePool, lease: Duration, delivery_limit: u32) -> Self {
        Self {
            pool,
            lease,
            delivery_limit: delivery_limit.max(1),
        }
    }

    /// Number of messages currently in a queue (leased included).
    pub async fn depth(&self, queue: &str) -> Result<u64, QueueError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM queue_messages WHERE queue = ?")
            .bind(queue)
            .fetch_one(&self.pool.reader)
            .await
            .map_err(|e| QueueError::Consume(e.to_string()))?;
        Ok(row.0 as u64)
    }
}

impl MessageBroker for SqliteBroker {
    async fn publish(
        &self,
        queue: &str,
        payload: &serde_json::Value,
        delay: Option<Duration>,
    ) -> Result<(), QueueError> {
        let now = Utc::now();
        let available_at = match delay {
            Some(delay) => {
                now + chrono::Duration::from_std(delay)
                    .map_err(|e| QueueError::Publish(e.to_string()))?
            }
            None => now,
        };
        let payload = serde_json::to_string(payload)
            .map_err(|e| QueueError::Payload(e.to_string()))?;

        sqlx::query(
            r#"INSERT INTO queue_messages
               (id, queue, payload, available_at, delivery_count, locked_until, created_at)
               VALUES (?, ?, ?, ?, 0, NULL, ?)"#,
        )
        .bind(Uuid::now_v7().to_string())
        .bind(queue)
        .bind(&payload)
        .bind(format_datetime(&available_at))
        .bind(format_datetime(&now))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| QueueError::Publish(e.to_string()))?;

        Ok(())
    }

    async fn receive(&self, queue: &str) -> Result<Option<Delivery>, QueueError> {
        let now = Utc::now();
        let locked_until = format_datetime(
            &(now + chrono::Duration::from_std(self.lease)
                .map_err(|e| QueueError::Consume(e.to_string()))?),
        );
        let now_str = format_datetime(&now);

        let row = sqlx::query(
            r#"UPDATE queue_messages
               SET locked_until = ?, delivery_count = delivery_count + 1
               WHERE id = (
                   SELECT id FROM queue_messages
                   WHERE queue = ?
                     AND available_at <= ?
                     AND (locked_until IS NULL OR locked_until <= ?)
                   ORDER BY available_at ASC, id ASC
                   LIMIT 1
               )
               RETURNING id, payload, delivery_count"#,
        )
        .bind(&locked_until)
        .bind(queue)
        .bind(&now_str)
        .bind(&now_str)
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(|e| QueueError::Consume(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let id: String = row
            .try_get("id")
            .map_err(|e| QueueError::Consume(e.to_string()))?;
        let payload: String = row
            .try_get("payload")
            .map_err(|e| QueueError::Consume(e.to_string()))?;
        let delivery_count: i64 = row
            .try_get("delivery_count")
            .map_err(|e| QueueError::Consume(e.to_string()))?;

        Ok(Some(Delivery {
            id: parse_uuid(&id).map_err(|e| QueueError::Consume(e.to_string()))?,
            queue: queue.to_string(),
            payload: serde_json::from_str(&payload)
                .map_err(|e| QueueError::Payload(e.to_string()))?,
            delivery_count: delivery_count as u32,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM queue_messages WHERE id = ?")
            .bind(delivery.id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| QueueError::Ack(e.to_string()))?;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        if delivery.delivery_count >= self.delivery_limit {
            tracing::warn!(
                queue = delivery.queue.as_str(),
                message_id = %delivery.id,
                deliveries = delivery.delivery_count,
                "delivery limit reached, routing to dead letter queue"
            );
            sqlx::query(
                "UPDATE queue_messages SET queue = ?, locked_until = NULL WHERE id = ?",
            )
            .bind(format!("{}{DEAD_LETTER_SUFFIX}", delivery.queue))
            .bind(delivery.id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| QueueError::Ack(e.to_string()))?;
        } else {
            sqlx::query("UPDATE queue_messages SET locked_until = NULL WHERE id = ?")
                .bind(delivery.id.to_string())
                .execute(&self.pool.writer)
                .await
                .map_err(|e| QueueError::Ack(e.to_string()))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
