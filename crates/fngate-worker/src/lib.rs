//! fngate-worker — the consuming half of the async invocation path.
//!
//! A [`QueueWorker`] leases messages from a [`fngate_queue::Broker`], calls
//! the function through an [`fngate_proxy::Invoker`], and hands 2xx results
//! to a [`CallbackSender`]. Failed invocations and failed callbacks each
//! retry on their own [`Backoff`] schedule before the message is
//! dead-lettered.

pub mod backoff;
pub mod callback;
pub mod worker;

pub use backoff::Backoff;
pub use callback::{
    CallbackError, CallbackRequest, CallbackSender, HttpCallbackSender, X_FUNCTION_NAME,
    X_FUNCTION_STATUS,
};
pub use worker::{MessageOutcome, QueueWorker, WorkerConfig, WorkerReport};
