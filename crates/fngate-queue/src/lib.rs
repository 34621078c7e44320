//! fngate-queue — the durable half of the async invocation path.
//!
//! The publisher turns an accepted HTTP invocation into a [`QueueMessage`]
//! and hands it to a [`Broker`]. Workers later lease messages from the
//! broker, and every message ends in exactly one terminal event: an ack or
//! a dead-letter record.
//!
//! # Architecture
//!
//! ```text
//! Publisher ──publish──▶ Broker (RedbBroker)
//!                          ├── queue_messages      {queue}/{enqueued_ms}/{id}
//!                          │     visible_at lease, delivery count
//!                          └── queue_dead_letters  {failed_ms}/{id}
//! QueueWorker ◀─receive── lease for visibility_timeout
//!             ──ack / nack / release / extend / dead_letter──▶
//! ```
//!
//! A leased message that is neither acked nor returned becomes visible again
//! once its lease expires, so a crashed worker never loses a message. The
//! `attempt` field of a delivered message is the number of earlier
//! deliveries.

pub mod broker;
pub mod error;
pub mod message;
pub mod publisher;
pub mod store;
pub mod tables;

pub use broker::{Broker, Delivery, Receipt};
pub use error::{QueueError, QueueResult};
pub use message::{DeadLetter, DeadLetterStage, QueueMessage};
pub use publisher::{AsyncInvocation, Publisher, PublisherConfig};
pub use store::RedbBroker;
