//! fngate-health — readiness of function replicas and of the gateway itself.
//!
//! Replica health is fed from two directions. Passively, the invocation
//! proxy reports every connection-level outcome; a sliding window of
//! failures turns a replica unready. Actively, when replica addresses are
//! known, a probe task per replica polls the watchdog health path and a run
//! of good probes brings an unready replica back.
//!
//! # State machine
//!
//! ```text
//!            N failures within T              M consecutive good probes
//!   Ready ───────────────────────▶ Unready ───────────────────────────▶ Ready
//!     │                               ▲
//!     │ K protocol violations         │ cooldown elapsed
//!     ▼                               │
//!   Quarantined ──────────────────────┘
//! ```
//!
//! Only `Ready` replicas are routable. Replicas the registry has never
//! heard of are treated as ready.

pub mod liveness;
pub mod monitor;
pub mod registry;
pub mod tracker;

pub use liveness::Liveness;
pub use monitor::{ProbeMonitor, http_probe};
pub use registry::HealthRegistry;
pub use tracker::{HealthPolicy, ProbeResult, ReplicaTracker};
