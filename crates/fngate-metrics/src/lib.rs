//! fngate-metrics — invocation metrics for the gateway.
//!
//! # Architecture
//!
//! ```text
//! MetricsCollector (implements Observer)
//!   ├── started()  ← proxy, once per admitted invocation
//!   ├── observe()  ← proxy, once per finished invocation
//!   ├── record()   ← async report from out-of-process workers
//!   └── snapshot() → MetricsSnapshot
//!
//! Prometheus exposition
//!   └── render_prometheus(snapshot, gauges) → text/plain for /metrics
//! ```

pub mod collector;
pub mod prometheus;

pub use collector::{InvocationSeries, MetricsCollector, MetricsSnapshot, LATENCY_BUCKETS};
pub use prometheus::{GatewayGauges, render_prometheus};
