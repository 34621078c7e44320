//! fngate-admission — backpressure at the edge.
//!
//! Three gauges decide whether a request may proceed:
//!
//! ```text
//!   global in-flight      ── every admitted request, sync or async
//!   per-function in-flight ── keyed by FunctionIdentity
//!   broker depth          ── last depth reported by the queue (async only)
//! ```
//!
//! Counters are incremented first and checked after, so two racing
//! requests can never both squeeze under a ceiling. A request that does not
//! fit undoes its increments and is rejected with a retry hint.
//!
//! An admitted request holds an [`AdmissionToken`]; dropping it releases
//! the counters exactly once, whichever way the request ends.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use fngate_core::config::AdmissionSettings;
use fngate_core::{FunctionIdentity, GatewayError, InvocationPath, Saturation};
use tracing::debug;

/// Ceilings; zero disables a ceiling.
#[derive(Debug, Clone)]
pub struct AdmissionLimits {
    pub max_inflight: usize,
    pub max_inflight_per_function: usize,
    pub max_queue_depth: u64,
    pub retry_after: Duration,
}

impl From<&AdmissionSettings> for AdmissionLimits {
    fn from(settings: &AdmissionSettings) -> Self {
        Self {
            max_inflight: settings.max_inflight,
            max_inflight_per_function: settings.max_inflight_per_function,
            max_queue_depth: settings.max_queue_depth,
            retry_after: settings.retry_after,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejection {
    pub reason: Saturation,
    pub retry_after: Duration,
}

impl Rejection {
    pub fn into_error(self) -> GatewayError {
        GatewayError::Admission {
            reason: self.reason,
            retry_after: self.retry_after,
        }
    }
}

#[derive(Debug)]
pub enum AdmitDecision {
    Allow(AdmissionToken),
    Reject(Rejection),
}

impl AdmitDecision {
    /// The token, or the rejection as a gateway error.
    pub fn into_result(self) -> Result<AdmissionToken, GatewayError> {
        match self {
            AdmitDecision::Allow(token) => Ok(token),
            AdmitDecision::Reject(rejection) => Err(rejection.into_error()),
        }
    }
}

struct Gauges {
    limits: AdmissionLimits,
    inflight: AtomicUsize,
    per_function: DashMap<FunctionIdentity, Arc<AtomicUsize>>,
    broker_depth: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Clone)]
pub struct Admission {
    gauges: Arc<Gauges>,
}

impl Admission {
    pub fn new(limits: AdmissionLimits) -> Self {
        Self {
            gauges: Arc::new(Gauges {
                limits,
                inflight: AtomicUsize::new(0),
                per_function: DashMap::new(),
                broker_depth: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
            }),
        }
    }

    pub fn limits(&self) -> &AdmissionLimits {
        &self.gauges.limits
    }

    pub fn admit(&self, identity: &FunctionIdentity, path: InvocationPath) -> AdmitDecision {
        let g = &self.gauges;

        if path == InvocationPath::Async
            && g.limits.max_queue_depth > 0
            && g.broker_depth.load(Ordering::Relaxed) >= g.limits.max_queue_depth
        {
            return self.reject(identity, Saturation::Broker);
        }

        let before = g.inflight.fetch_add(1, Ordering::AcqRel);
        if g.limits.max_inflight > 0 && before >= g.limits.max_inflight {
            g.inflight.fetch_sub(1, Ordering::AcqRel);
            return self.reject(identity, Saturation::Global);
        }

        let counter = self.function_counter(identity);
        let before = counter.fetch_add(1, Ordering::AcqRel);
        if g.limits.max_inflight_per_function > 0 && before >= g.limits.max_inflight_per_function {
            counter.fetch_sub(1, Ordering::AcqRel);
            g.inflight.fetch_sub(1, Ordering::AcqRel);
            return self.reject(identity, Saturation::Function);
        }

        AdmitDecision::Allow(AdmissionToken {
            gauges: g.clone(),
            function: counter,
        })
    }

    /// Latest broker depth, the pressure signal for the async path.
    pub fn record_broker_depth(&self, depth: u64) {
        self.gauges.broker_depth.store(depth, Ordering::Relaxed);
    }

    pub fn broker_depth(&self) -> u64 {
        self.gauges.broker_depth.load(Ordering::Relaxed)
    }

    pub fn inflight(&self) -> usize {
        self.gauges.inflight.load(Ordering::Acquire)
    }

    pub fn inflight_for(&self, identity: &FunctionIdentity) -> usize {
        self.gauges
            .per_function
            .get(identity)
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn rejected_total(&self) -> u64 {
        self.gauges.rejected.load(Ordering::Relaxed)
    }

    /// `(function, in-flight)` for every function seen, sorted.
    pub fn snapshot(&self) -> Vec<(FunctionIdentity, usize)> {
        let mut entries: Vec<_> = self
            .gauges
            .per_function
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Acquire)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    fn function_counter(&self, identity: &FunctionIdentity) -> Arc<AtomicUsize> {
        if let Some(counter) = self.gauges.per_function.get(identity) {
            return counter.clone();
        }
        self.gauges
            .per_function
            .entry(identity.clone())
            .or_default()
            .clone()
    }

    fn reject(&self, identity: &FunctionIdentity, reason: Saturation) -> AdmitDecision {
        self.gauges.rejected.fetch_add(1, Ordering::Relaxed);
        debug!(function = %identity, reason = reason.as_str(), "request rejected");
        AdmitDecision::Reject(Rejection {
            reason,
            retry_after: self.gauges.limits.retry_after,
        })
    }
}

/// Proof of admission. Releases its counters when dropped.
pub struct AdmissionToken {
    gauges: Arc<Gauges>,
    function: Arc<AtomicUsize>,
}

impl AdmissionToken {
    /// Release now rather than at end of scope.
    pub fn release(self) {}
}

impl Drop for AdmissionToken {
    fn drop(&mut self) {
        self.function.fetch_sub(1, Ordering::AcqRel);
        self.gauges.inflight.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for AdmissionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionToken").finish_non_exhaustive()
    }
}
