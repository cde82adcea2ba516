//! Topic-based publish/subscribe transport for stage events.
//!
//! Delivery is at-least-once: a subscription yields every message after the
//! subscriber's last acknowledged sequence number, and acknowledging is the
//! consumer's job once it has processed a message idempotently. Ordering is
//! only guaranteed within a topic.

use crate::error::Result;
use crate::stage::{self, StageEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::VecDeque;
use tracing::{debug, instrument};

const DEFAULT_BATCH_SIZE: i64 = 64;

/// A message handed to a subscriber.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub seq: i64,
    pub topic: String,
    pub payload: String,
}

impl Delivery {
    pub fn event(&self) -> Result<StageEvent> {
        stage::decode(&self.payload)
    }
}

#[async_trait]
pub trait Subscription: Send {
    fn topic(&self) -> &str;

    /// Next unacknowledged message, or `None` once the topic is drained.
    async fn next(&mut self) -> Result<Option<Delivery>>;

    /// Mark everything up to and including `seq` as processed.
    async fn ack(&mut self, seq: i64) -> Result<()>;
}

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Fire-and-forget publish; returns the message sequence number.
    async fn publish(&self, topic: &str, event: &StageEvent) -> Result<i64>;

    async fn subscribe(&self, subscriber: &str, topic: &str) -> Result<Box<dyn Subscription>>;
}

/// Durable bus stored next to the request records.
#[derive(Clone)]
pub struct SqliteEventBus {
    pool: SqlitePool,
    batch_size: i64,
}

impl SqliteEventBus {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Publish on an open connection so the message commits together with
    /// whatever state change produced it.
    pub async fn publish_in_tx(
        conn: &mut SqliteConnection,
        topic: &str,
        event: &StageEvent,
    ) -> Result<i64> {
        let payload = stage::encode(event)?;

        let result =
            sqlx::query("INSERT INTO bus_messages (topic, payload, published_at) VALUES (?, ?, ?)")
                .bind(topic)
                .bind(&payload)
                .bind(Utc::now().timestamp())
                .execute(&mut *conn)
                .await?;

        let seq = result.last_insert_rowid();
        debug!(
            topic,
            seq,
            request_id = %event.request_id,
            stage = %event.stage,
            status = %event.status,
            "Published stage event"
        );

        Ok(seq)
    }

    /// Last sequence number acknowledged by `subscriber` on `topic`.
    pub async fn acked_seq(&self, subscriber: &str, topic: &str) -> Result<i64> {
        let acked: Option<i64> = sqlx::query_scalar(
            "SELECT acked_seq FROM bus_offsets WHERE subscriber = ? AND topic = ?",
        )
        .bind(subscriber)
        .bind(topic)
        .fetch_optional(&self.pool)
        .await?;

        Ok(acked.unwrap_or(0))
    }

    /// Number of messages on `topic` not yet acknowledged by `subscriber`.
    pub async fn backlog(&self, subscriber: &str, topic: &str) -> Result<i64> {
        let acked = self.acked_seq(subscriber, topic).await?;

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM bus_messages WHERE topic = ? AND seq > ?")
                .bind(topic)
                .bind(acked)
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }

    /// Delete messages published before `cutoff` that every subscriber of
    /// their topic has acknowledged. Topics nobody subscribed to are kept.
    pub async fn prune_acked(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let deleted = sqlx::query(
            "DELETE FROM bus_messages
             WHERE published_at < ?
               AND seq <= (SELECT MIN(o.acked_seq) FROM bus_offsets o WHERE o.topic = bus_messages.topic)",
        )
        .bind(cutoff.timestamp())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(deleted)
    }

    /// All retained events published on `topic`, oldest first.
    pub async fn history(&self, topic: &str) -> Result<Vec<StageEvent>> {
        let payloads: Vec<String> =
            sqlx::query_scalar("SELECT payload FROM bus_messages WHERE topic = ? ORDER BY seq")
                .bind(topic)
                .fetch_all(&self.pool)
                .await?;

        payloads.iter().map(|p| stage::decode(p)).collect()
    }
}

#[async_trait]
impl EventBus for SqliteEventBus {
    #[instrument(skip(self, event), fields(request_id = %event.request_id))]
    async fn publish(&self, topic: &str, event: &StageEvent) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        Self::publish_in_tx(&mut conn, topic, event).await
    }

    async fn subscribe(&self, subscriber: &str, topic: &str) -> Result<Box<dyn Subscription>> {
        let cursor = self.acked_seq(subscriber, topic).await?;

        Ok(Box::new(SqliteSubscription {
            pool: self.pool.clone(),
            subscriber: subscriber.to_string(),
            topic: topic.to_string(),
            cursor,
            buffer: VecDeque::new(),
            batch_size: self.batch_size,
        }))
    }
}

struct SqliteSubscription {
    pool: SqlitePool,
    subscriber: String,
    topic: String,
    cursor: i64,
    buffer: VecDeque<Delivery>,
    batch_size: i64,
}

#[async_trait]
impl Subscription for SqliteSubscription {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn next(&mut self) -> Result<Option<Delivery>> {
        if self.buffer.is_empty() {
            let rows = sqlx::query_as::<_, (i64, String, String)>(
                "SELECT seq, topic, payload FROM bus_messages
                 WHERE topic = ? AND seq > ?
                 ORDER BY seq
                 LIMIT ?",
            )
            .bind(&self.topic)
            .bind(self.cursor)
            .bind(self.batch_size)
            .fetch_all(&self.pool)
            .await?;

            self.buffer
                .extend(rows.into_iter().map(|(seq, topic, payload)| Delivery {
                    seq,
                    topic,
                    payload,
                }));
        }

        let delivery = self.buffer.pop_front();
        if let Some(d) = &delivery {
            self.cursor = d.seq;
        }

        Ok(delivery)
    }

    async fn ack(&mut self, seq: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO bus_offsets (subscriber, topic, acked_seq, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(subscriber, topic)
             DO UPDATE SET acked_seq = MAX(acked_seq, excluded.acked_seq), updated_at = excluded.updated_at",
        )
        .bind(&self.subscriber)
        .bind(&self.topic)
        .bind(seq)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
