//! fngate-autoscale — replica scaling driven by alerts and by traffic to
//! idle functions.
//!
//! # Scaling Algorithm
//!
//! ```text
//! policy  = labels: com.openfaas.scale.{min,max,factor,step,cooldown,zero}
//! step    = explicit step, else ceil(max · factor / 100)
//!
//! firing:    desired = clamp(current + step, floor, max)
//! resolved:  desired = clamp(max(current − step, min), floor, max)
//! floor      = min, or max(min, 1) unless zero scaling is allowed
//!
//! cold request (desired == 0):  scale to max(min, 1), wait for a replica
//! ```
//!
//! A successful change starts a per-function cooldown during which further
//! alerts for that function are reported but not acted on.

pub mod policy;
pub mod scaler;
pub mod zero;

pub use policy::ReplicaScalingPolicy;
pub use scaler::{
    Alert, AlertBatch, AlertLabels, AlertScaler, ScalingDecision, ScalingOutcome, ScalingReason,
};
pub use zero::{Readiness, ZeroScaler};
