//! Error types for the async queue.

use fngate_core::GatewayError;
use thiserror::Error;

/// Result type alias for broker operations.
pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to open queue database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    /// The lease expired and the message was handed to someone else, or it
    /// already reached a terminal state.
    #[error("lease lost for message {0}")]
    LeaseLost(String),
}

impl From<QueueError> for GatewayError {
    fn from(err: QueueError) -> Self {
        GatewayError::BrokerFailure(err.to_string())
    }
}
