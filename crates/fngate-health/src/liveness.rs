//! Gateway self-liveness, reported by `/healthz`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether the gateway is accepting traffic.
///
/// Starts not-ready; the daemon flips it once listeners and the broker are
/// up, and flips it back when shutdown begins so load balancers drain it.
#[derive(Clone)]
pub struct Liveness {
    ready: Arc<AtomicBool>,
}

impl Liveness {
    pub fn new() -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn mark_draining(&self) {
        self.ready.store(false, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}
