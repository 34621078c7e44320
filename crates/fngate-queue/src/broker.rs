//! Broker capability.

use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::QueueResult;
use crate::message::{DeadLetter, QueueMessage};

/// Proof of a lease, required by every follow-up call on a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub key: String,
    pub token: String,
}

/// A leased message.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: QueueMessage,
    pub receipt: Receipt,
    /// When the lease lapses and the message becomes visible again.
    pub leased_until: Instant,
}

impl Delivery {
    pub fn lease_remaining(&self) -> Duration {
        self.leased_until.saturating_duration_since(Instant::now())
    }
}

/// At-least-once message channel between publisher and workers.
///
/// A delivered message stays leased until exactly one of `ack`, `nack`,
/// `release`, or `dead_letter` is called, or until the lease lapses.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Durably store a message. Returns once the broker has accepted it.
    async fn publish(&self, message: &QueueMessage) -> QueueResult<()>;

    /// Lease the oldest visible message of `queue`, waiting up to `wait`.
    async fn receive(&self, queue: &str, wait: Duration) -> QueueResult<Option<Delivery>>;

    /// Remove a processed message.
    async fn ack(&self, delivery: &Delivery) -> QueueResult<()>;

    /// Return a failed message for redelivery after `delay`.
    async fn nack(&self, delivery: &Delivery, delay: Duration) -> QueueResult<()>;

    /// Return a message that was not processed. The delivery does not count
    /// against its attempt budget.
    async fn release(&self, delivery: &Delivery, delay: Duration) -> QueueResult<()>;

    /// Push the lease out to `now + by`.
    async fn extend(&self, delivery: &mut Delivery, by: Duration) -> QueueResult<()>;

    /// Remove the message and record it as dead in one step.
    async fn dead_letter(&self, delivery: &Delivery, record: DeadLetter) -> QueueResult<()>;

    /// Messages stored across all queues, leased or not.
    async fn depth(&self) -> QueueResult<u64>;

    /// Most recent dead-letter records, newest first.
    async fn dead_letters(&self, limit: usize) -> QueueResult<Vec<DeadLetter>>;

    fn visibility_timeout(&self) -> Duration;
}
