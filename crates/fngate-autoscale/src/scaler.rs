//! Alert-driven scaling.
//!
//! Alertmanager posts batches of alerts; each names a function and is either
//! `firing` or `resolved`. For every distinct function in the batch the
//! scaler reads the current status, derives the [`ReplicaScalingPolicy`]
//! from its labels, and moves the replica count one step:
//!
//! ```text
//! firing  (alertname == configured)  desired = clamp(current + step)
//! resolved                           desired = clamp(max(current − step, min))
//! desired == current                 NoChange
//! inside cooldown                    CoolingDown, no orchestrator call
//! ```
//!
//! A function that fails to look up or to scale is reported as `Failed`; the
//! rest of the batch carries on. Nothing is retried here; the next alert
//! re-evaluates.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use fngate_core::config::ScalingSettings;
use fngate_core::{FunctionIdentity, FunctionProvider};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::policy::ReplicaScalingPolicy;

// ── Alert payload ──────────────────────────────────────────────

/// Alertmanager webhook body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertBatch {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub receiver: String,
    #[serde(default)]
    pub alerts: Vec<Alert>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Alert {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub labels: AlertLabels,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertLabels {
    #[serde(rename = "alertname", default)]
    pub alert_name: String,
    #[serde(default)]
    pub function_name: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

// ── Decisions ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalingReason {
    Firing,
    Resolved,
    /// An operator asked for an exact count.
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalingDecision {
    pub function: FunctionIdentity,
    pub current_replicas: u32,
    pub desired_replicas: u32,
    pub reason: ScalingReason,
    /// Milliseconds since the Unix epoch.
    pub observed_at: u64,
}

/// Per-function result of an alert batch or a direct scale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum ScalingOutcome {
    Scaled(ScalingDecision),
    NoChange(ScalingDecision),
    #[serde(rename_all = "camelCase")]
    CoolingDown {
        function: FunctionIdentity,
        remaining_ms: u64,
    },
    Ignored {
        function: String,
        reason: String,
    },
    Failed {
        function: String,
        error: String,
    },
}

impl ScalingOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, ScalingOutcome::Failed { .. })
    }
}

// ── Scaler ─────────────────────────────────────────────────────

pub struct AlertScaler {
    provider: Arc<dyn FunctionProvider>,
    settings: ScalingSettings,
    default_namespace: String,
    /// Function → end of its cooldown.
    cooldowns: Mutex<HashMap<FunctionIdentity, Instant>>,
    shutdown: CancellationToken,
}

impl AlertScaler {
    pub fn new(
        provider: Arc<dyn FunctionProvider>,
        settings: ScalingSettings,
        default_namespace: &str,
    ) -> Self {
        Self {
            provider,
            settings,
            default_namespace: default_namespace.to_string(),
            cooldowns: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop evaluating further functions of a batch once `token` fires.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn settings(&self) -> &ScalingSettings {
        &self.settings
    }

    /// Evaluate a batch, one outcome per distinct function in order of first
    /// appearance. When a function appears more than once the last alert wins.
    pub async fn on_alert(&self, batch: AlertBatch) -> Vec<ScalingOutcome> {
        let mut order: Vec<String> = Vec::new();
        let mut latest: HashMap<String, Alert> = HashMap::new();
        let mut outcomes = Vec::new();

        for alert in batch.alerts {
            let name = &alert.labels.function_name;
            if name.is_empty() {
                outcomes.push(ScalingOutcome::Ignored {
                    function: String::new(),
                    reason: "alert has no function_name label".into(),
                });
                continue;
            }
            let key = match &alert.labels.namespace {
                Some(ns) if !ns.is_empty() => format!("{name}.{ns}"),
                _ => name.clone(),
            };
            if !latest.contains_key(&key) {
                order.push(key.clone());
            }
            latest.insert(key, alert);
        }

        for key in order {
            if self.shutdown.is_cancelled() {
                outcomes.push(ScalingOutcome::Ignored {
                    function: key,
                    reason: "shutting down".into(),
                });
                continue;
            }
            let Some(alert) = latest.remove(&key) else {
                continue;
            };
            let outcome = self.evaluate(&key, &alert).await;
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn evaluate(&self, key: &str, alert: &Alert) -> ScalingOutcome {
        let reason = match alert.status.as_str() {
            "firing" if alert.labels.alert_name == self.settings.alert_name => ScalingReason::Firing,
            "firing" => {
                return ScalingOutcome::Ignored {
                    function: key.to_string(),
                    reason: format!("alert {:?} does not drive scaling", alert.labels.alert_name),
                };
            }
            "resolved" => ScalingReason::Resolved,
            other => {
                return ScalingOutcome::Ignored {
                    function: key.to_string(),
                    reason: format!("unknown alert status {other:?}"),
                };
            }
        };

        let identity = match FunctionIdentity::parse(key, &self.default_namespace) {
            Ok(identity) => identity,
            Err(e) => {
                return ScalingOutcome::Failed {
                    function: key.to_string(),
                    error: e.to_string(),
                };
            }
        };

        if let Some(remaining) = self.cooling_down(&identity) {
            debug!(function = %identity, remaining_ms = remaining.as_millis() as u64, "scaling cooldown active");
            return ScalingOutcome::CoolingDown {
                function: identity,
                remaining_ms: remaining.as_millis() as u64,
            };
        }

        let status = match self.provider.lookup(&identity).await {
            Ok(status) => status,
            Err(e) => {
                warn!(function = %identity, error = %e, "status lookup for scaling failed");
                return ScalingOutcome::Failed {
                    function: identity.to_string(),
                    error: e.to_string(),
                };
            }
        };

        let policy = ReplicaScalingPolicy::from_status(&status, &self.settings);
        let current = status.replicas;
        // A pinned replica count is left alone.
        let desired = if policy.step == 0 || policy.min == policy.max {
            current
        } else {
            match reason {
                ScalingReason::Firing => policy.scale_up(current),
                _ => policy.scale_down(current),
            }
        };
        let decision = ScalingDecision {
            function: identity.clone(),
            current_replicas: current,
            desired_replicas: desired,
            reason,
            observed_at: epoch_millis(),
        };

        if desired == current {
            debug!(function = %identity, replicas = current, ?reason, "no scaling change");
            return ScalingOutcome::NoChange(decision);
        }

        match self.provider.scale(&identity, desired).await {
            Ok(()) => {
                info!(function = %identity, from = current, to = desired, ?reason, "function scaled");
                self.cooldowns
                    .lock()
                    .expect("cooldown lock")
                    .insert(identity, Instant::now() + policy.cooldown);
                ScalingOutcome::Scaled(decision)
            }
            Err(e) => {
                warn!(function = %identity, from = current, to = desired, error = %e, "scaling action failed");
                ScalingOutcome::Failed {
                    function: identity.to_string(),
                    error: e.to_string(),
                }
            }
        }
    }

    /// Set an exact replica count. Bypasses policy and cooldown.
    pub async fn scale_to(&self, identity: &FunctionIdentity, replicas: u32) -> ScalingOutcome {
        let status = match self.provider.lookup(identity).await {
            Ok(status) => status,
            Err(e) => {
                return ScalingOutcome::Failed {
                    function: identity.to_string(),
                    error: e.to_string(),
                };
            }
        };
        let decision = ScalingDecision {
            function: identity.clone(),
            current_replicas: status.replicas,
            desired_replicas: replicas,
            reason: ScalingReason::Direct,
            observed_at: epoch_millis(),
        };
        if status.replicas == replicas {
            return ScalingOutcome::NoChange(decision);
        }
        match self.provider.scale(identity, replicas).await {
            Ok(()) => {
                info!(function = %identity, from = status.replicas, to = replicas, "function scaled on request");
                ScalingOutcome::Scaled(decision)
            }
            Err(e) => ScalingOutcome::Failed {
                function: identity.to_string(),
                error: e.to_string(),
            },
        }
    }

    fn cooling_down(&self, identity: &FunctionIdentity) -> Option<Duration> {
        let mut cooldowns = self.cooldowns.lock().expect("cooldown lock");
        let until = *cooldowns.get(identity)?;
        let now = Instant::now();
        if until > now {
            Some(until - now)
        } else {
            cooldowns.remove(identity);
            None
        }
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
