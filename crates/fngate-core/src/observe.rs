//! Invocation observation records.
//!
//! The proxy emits exactly one [`Observation`] per invocation attempt
//! sequence, whatever the outcome. Sinks implement [`Observer`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::FunctionIdentity;

/// Which edge path an invocation entered through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationPath {
    Sync,
    Async,
}

impl InvocationPath {
    pub fn as_str(self) -> &'static str {
        match self {
            InvocationPath::Sync => "sync",
            InvocationPath::Async => "async",
        }
    }
}

/// Outcome of one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    pub function: String,
    pub namespace: String,
    pub status: u16,
    pub duration_ns: u64,
    /// Bytes sent upstream.
    pub bytes_out: u64,
    /// Bytes received from upstream.
    pub bytes_in: u64,
    pub call_id: String,
    pub path: InvocationPath,
}

pub trait Observer: Send + Sync {
    /// An invocation was admitted and is about to be forwarded.
    fn started(&self, _identity: &FunctionIdentity) {}

    fn observe(&self, observation: &Observation);
}

/// Writes every observation as a structured log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl Observer for LogObserver {
    fn observe(&self, o: &Observation) {
        info!(
            function = %o.function,
            namespace = %o.namespace,
            status = o.status,
            duration_ms = o.duration_ns as f64 / 1_000_000.0,
            bytes_out = o.bytes_out,
            bytes_in = o.bytes_in,
            call_id = %o.call_id,
            path = o.path.as_str(),
            "invocation finished"
        );
    }
}

/// Forwards to several observers in order.
#[derive(Clone, Default)]
pub struct FanOut(pub Vec<Arc<dyn Observer>>);

impl Observer for FanOut {
    fn started(&self, identity: &FunctionIdentity) {
        for observer in &self.0 {
            observer.started(identity);
        }
    }

    fn observe(&self, observation: &Observation) {
        for observer in &self.0 {
            observer.observe(observation);
        }
    }
}
