//! Queue boundary: at-least-once consumption with manual acknowledgment
//!
//! A [`QueueClient`] hands out a stream of [`Delivery`] values for a named
//! queue. Every delivery must be settled exactly once, either acknowledged
//! or rejected; the envelope carries the [`Acknowledger`] of the transport it
//! came from, so settling never needs a reference back to the client.

pub mod memory;
pub mod redis_streams;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use postguard_core::{PublishError, Result};
use std::fmt;
use std::sync::Arc;

pub use self::memory::InMemoryBroker;
pub use self::redis_streams::{RedisSettings, RedisStreamsClient};

/// Deliveries from one queue, in transport order.
///
/// The stream ends when the transport closes.
pub type Subscription = BoxStream<'static, Delivery>;

#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Start consuming `queue`
    async fn consume(&self, queue: &str) -> Result<Subscription>;

    /// Append `payload` to `queue`
    async fn publish(&self, queue: &str, payload: Bytes) -> std::result::Result<(), PublishError>;
}

/// Transport side of settling a delivery
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Reject `delivery`; with `requeue` it will be delivered again,
    /// otherwise it is dead-lettered.
    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<()>;
}

/// One message taken off a queue, not yet settled
pub struct Delivery {
    tag: String,
    payload: Bytes,
    delivery_count: u32,
    acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        tag: impl Into<String>,
        payload: Bytes,
        delivery_count: u32,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            tag: tag.into(),
            payload,
            delivery_count,
            acker,
        }
    }

    /// Transport-assigned identifier, unique among unsettled deliveries
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// How many times this message has been delivered before (0 on first)
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub async fn ack(self) -> Result<()> {
        let acker = Arc::clone(&self.acker);
        acker.ack(&self).await
    }

    pub async fn reject(self, requeue: bool) -> Result<()> {
        let acker = Arc::clone(&self.acker);
        acker.reject(&self, requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("tag", &self.tag)
            .field("payload_len", &self.payload.len())
            .field("delivery_count", &self.delivery_count)
            .finish()
    }
}
