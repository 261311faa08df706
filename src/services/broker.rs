use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

/// Main work queue.
pub const MAIN_QUEUE: &str = "tasks.main";
/// Dead-letter queue; holds [`DeadLetter`] envelopes.
pub const DLQ: &str = "tasks.dlq";

/// Envelope wrapping a dead-lettered message. The broker records why the
/// message died; the body is carried through opaque and unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub body: String,
    pub reasons: Vec<String>,
    pub deaths: u32,
}

/// One in-flight message. Held unacked until settled.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: String,
    pub payload: String,
}

/// How a consumer settles a delivery.
#[derive(Debug, Clone)]
pub enum Disposition {
    Ack,
    /// Put the message back at the head of its queue.
    NackRequeue,
    /// Route the message to the dead-letter queue.
    NackDlq { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueDepth {
    pub ready: u64,
    pub unacked: u64,
}

/// Durable FIFO work-queue capability with at-least-once delivery.
///
/// `receive` hands out one message at a time per consumer (prefetch = 1);
/// the message stays unacked until `settle` is called. `publish` resolves
/// only once the broker has confirmed the write. A non-zero `delay` defers
/// visibility, which is how DLQ re-drives implement backoff.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, queue: &str, body: &str, delay: Duration) -> Result<(), BrokerError>;

    async fn receive(&self, queue: &str, wait: Duration)
        -> Result<Option<Delivery>, BrokerError>;

    async fn settle(&self, delivery: &Delivery, disposition: Disposition)
        -> Result<(), BrokerError>;

    async fn queue_depth(&self, queue: &str) -> Result<QueueDepth, BrokerError>;

    async fn ping(&self) -> Result<(), BrokerError>;
}

fn unacked_key(queue: &str) -> String {
    format!("{queue}.unacked")
}

fn wait_key(queue: &str) -> String {
    format!("{queue}.wait")
}

/// Redis-backed broker.
///
/// Each queue is a list pushed on the left and popped on the right, so pop
/// order is publish order. Receiving moves the message into a per-queue
/// unacked list (the at-least-once window); ack removes it, nack-requeue
/// pushes it back at the pop end, nack-dlq wraps it in a [`DeadLetter`]
/// envelope on `tasks.dlq`. Delayed publishes land in a due-time sorted set
/// (`<queue>.wait`) that is drained into the queue on every receive.
pub struct RedisBroker {
    client: redis::Client,
}

impl RedisBroker {
    pub fn new(redis_url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url).map_err(BrokerError::Redis)?;
        Ok(Self { client })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, BrokerError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(BrokerError::Redis)
    }

    /// Move wait-queue entries whose due time has passed onto the queue.
    async fn drain_due(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        queue: &str,
    ) -> Result<(), BrokerError> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let due: Vec<String> = conn
            .zrangebyscore_limit(wait_key(queue), 0, now_ms, 0, 100)
            .await
            .map_err(BrokerError::Redis)?;

        for body in due {
            // Only the mover that wins the remove gets to enqueue.
            let removed: u64 = conn
                .zrem(wait_key(queue), &body)
                .await
                .map_err(BrokerError::Redis)?;
            if removed > 0 {
                conn.lpush::<_, _, ()>(queue, &body)
                    .await
                    .map_err(BrokerError::Redis)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, queue: &str, body: &str, delay: Duration) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        if delay.is_zero() {
            conn.lpush::<_, _, ()>(queue, body)
                .await
                .map_err(BrokerError::Redis)?;
        } else {
            let due_ms = chrono::Utc::now().timestamp_millis() + delay.as_millis() as i64;
            conn.zadd::<_, _, _, ()>(wait_key(queue), body, due_ms)
                .await
                .map_err(BrokerError::Redis)?;
        }
        Ok(())
    }

    async fn receive(
        &self,
        queue: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, BrokerError> {
        let mut conn = self.conn().await?;
        self.drain_due(&mut conn, queue).await?;

        let payload: Option<String> = conn
            .brpoplpush(queue, unacked_key(queue), wait.as_secs_f64())
            .await
            .map_err(BrokerError::Redis)?;

        Ok(payload.map(|payload| Delivery {
            queue: queue.to_string(),
            payload,
        }))
    }

    async fn settle(
        &self,
        delivery: &Delivery,
        disposition: Disposition,
    ) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        conn.lrem::<_, _, ()>(unacked_key(&delivery.queue), 1, &delivery.payload)
            .await
            .map_err(BrokerError::Redis)?;

        match disposition {
            Disposition::Ack => {}
            Disposition::NackRequeue => {
                conn.rpush::<_, _, ()>(&delivery.queue, &delivery.payload)
                    .await
                    .map_err(BrokerError::Redis)?;
            }
            Disposition::NackDlq { reason } => {
                let envelope = DeadLetter {
                    body: delivery.payload.clone(),
                    reasons: vec![reason],
                    deaths: 1,
                };
                let serialized =
                    serde_json::to_string(&envelope).map_err(BrokerError::Serialize)?;
                conn.lpush::<_, _, ()>(DLQ, serialized)
                    .await
                    .map_err(BrokerError::Redis)?;
            }
        }
        Ok(())
    }

    async fn queue_depth(&self, queue: &str) -> Result<QueueDepth, BrokerError> {
        let mut conn = self.conn().await?;
        let ready: u64 = conn.llen(queue).await.map_err(BrokerError::Redis)?;
        let unacked: u64 = conn
            .llen(unacked_key(queue))
            .await
            .map_err(BrokerError::Redis)?;
        Ok(QueueDepth { ready, unacked })
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(BrokerError::Redis)?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
