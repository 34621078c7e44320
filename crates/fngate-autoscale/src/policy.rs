//! Per-function scaling bounds read from labels.

use std::collections::HashMap;
use std::time::Duration;

use fngate_core::config::ScalingSettings;
use fngate_core::{FunctionStatus, parse_bool, parse_duration};
use tracing::warn;

pub const MIN_SCALE_LABEL: &str = "com.openfaas.scale.min";
pub const MAX_SCALE_LABEL: &str = "com.openfaas.scale.max";
/// Percentage of `max` added or removed per alert when no step is given.
pub const SCALE_FACTOR_LABEL: &str = "com.openfaas.scale.factor";
pub const SCALE_STEP_LABEL: &str = "com.openfaas.scale.step";
pub const SCALE_COOLDOWN_LABEL: &str = "com.openfaas.scale.cooldown";
pub const SCALE_ZERO_LABEL: &str = "com.openfaas.scale.zero";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaScalingPolicy {
    pub min: u32,
    pub max: u32,
    pub step: u32,
    pub cooldown: Duration,
    pub zero_scale_allowed: bool,
}

impl ReplicaScalingPolicy {
    pub fn defaults(settings: &ScalingSettings) -> Self {
        let max = settings.default_max.max(settings.default_min);
        Self {
            min: settings.default_min,
            max,
            step: step_from_factor(max, settings.default_factor),
            cooldown: settings.cooldown,
            zero_scale_allowed: false,
        }
    }

    /// Policy of one function. Labels win over annotations, unparsable
    /// values fall back to the defaults.
    pub fn from_status(status: &FunctionStatus, settings: &ScalingSettings) -> Self {
        Self::from_labels(&status.labels, &status.annotations, settings)
    }

    pub fn from_labels(
        labels: &HashMap<String, String>,
        annotations: &HashMap<String, String>,
        settings: &ScalingSettings,
    ) -> Self {
        let lookup = |key: &str| {
            labels
                .get(key)
                .or_else(|| annotations.get(key))
                .map(|v| v.trim())
        };
        let number = |key: &str, default: u32| match lookup(key) {
            None => default,
            Some(raw) => raw.parse::<u32>().unwrap_or_else(|_| {
                warn!(label = key, value = raw, "ignoring unparsable scaling label");
                default
            }),
        };

        let min = number(MIN_SCALE_LABEL, settings.default_min);
        let max = number(MAX_SCALE_LABEL, settings.default_max).max(min);
        let factor = number(SCALE_FACTOR_LABEL, settings.default_factor).min(100);
        let step = match lookup(SCALE_STEP_LABEL) {
            Some(_) => number(SCALE_STEP_LABEL, 0),
            None => step_from_factor(max, factor),
        };
        let cooldown = match lookup(SCALE_COOLDOWN_LABEL) {
            None => settings.cooldown,
            Some(raw) => parse_duration(raw).unwrap_or_else(|| {
                warn!(label = SCALE_COOLDOWN_LABEL, value = raw, "ignoring unparsable scaling label");
                settings.cooldown
            }),
        };
        let zero_scale_allowed = lookup(SCALE_ZERO_LABEL).map(parse_bool).unwrap_or(false);

        Self {
            min,
            max,
            step,
            cooldown,
            zero_scale_allowed,
        }
    }

    /// Lowest count this policy ever asks for.
    pub fn floor(&self) -> u32 {
        if self.zero_scale_allowed {
            self.min
        } else {
            self.min.max(1)
        }
    }

    pub fn clamp(&self, replicas: u32) -> u32 {
        replicas.clamp(self.floor(), self.max.max(self.floor()))
    }

    pub fn scale_up(&self, current: u32) -> u32 {
        self.clamp(current.saturating_add(self.step))
    }

    pub fn scale_down(&self, current: u32) -> u32 {
        self.clamp(current.saturating_sub(self.step).max(self.min))
    }
}

/// `ceil(max · factor / 100)`.
fn step_from_factor(max: u32, factor: u32) -> u32 {
    ((max as u64 * factor as u64).div_ceil(100)) as u32
}

#[cfg(test)]
mod tests {
    use fngate_core::GatewayConfig;

    use super::*;

    fn settings() -> ScalingSettings {
        GatewayConfig::default().scaling
    }

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_match_gateway() {
        let policy = ReplicaScalingPolicy::defaults(&settings());
        assert_eq!(policy.min, 1);
        assert_eq!(policy.max, 20);
        // 20% of 20.
        assert_eq!(policy.step, 4);
        assert!(!policy.zero_scale_allowed);
        assert_eq!(
            ReplicaScalingPolicy::from_labels(&HashMap::new(), &HashMap::new(), &settings()),
            policy
        );
    }

    #[test]
    fn labels_override_annotations() {
        let policy = ReplicaScalingPolicy::from_labels(
            &labels(&[(MIN_SCALE_LABEL, "2"), (MAX_SCALE_LABEL, "10")]),
            &labels(&[(MIN_SCALE_LABEL, "5"), (SCALE_STEP_LABEL, "3"), (SCALE_COOLDOWN_LABEL, "1m")]),
            &settings(),
        );
        assert_eq!(policy.min, 2);
        assert_eq!(policy.max, 10);
        assert_eq!(policy.step, 3);
        assert_eq!(policy.cooldown, Duration::from_secs(60));
    }

    #[test]
    fn factor_derives_step_from_max() {
        let policy = ReplicaScalingPolicy::from_labels(
            &labels(&[(MAX_SCALE_LABEL, "7"), (SCALE_FACTOR_LABEL, "50")]),
            &HashMap::new(),
            &settings(),
        );
        assert_eq!(policy.step, 4);

        let frozen = ReplicaScalingPolicy::from_labels(
            &labels(&[(SCALE_FACTOR_LABEL, "0")]),
            &HashMap::new(),
            &settings(),
        );
        assert_eq!(frozen.step, 0);
    }

    #[test]
    fn bad_values_fall_back() {
        let policy = ReplicaScalingPolicy::from_labels(
            &labels(&[(MIN_SCALE_LABEL, "lots"), (SCALE_COOLDOWN_LABEL, "soon")]),
            &HashMap::new(),
            &settings(),
        );
        assert_eq!(policy.min, 1);
        assert_eq!(policy.cooldown, settings().cooldown);
    }

    #[test]
    fn max_below_min_is_raised() {
        let policy = ReplicaScalingPolicy::from_labels(
            &labels(&[(MIN_SCALE_LABEL, "5"), (MAX_SCALE_LABEL, "3")]),
            &HashMap::new(),
            &settings(),
        );
        assert_eq!(policy.max, 5);
        assert_eq!(policy.scale_up(5), 5);
    }

    #[test]
    fn steps_stay_within_bounds() {
        let policy = ReplicaScalingPolicy {
            min: 1,
            max: 10,
            step: 4,
            cooldown: Duration::ZERO,
            zero_scale_allowed: false,
        };
        assert_eq!(policy.scale_up(1), 5);
        assert_eq!(policy.scale_up(8), 10);
        assert_eq!(policy.scale_down(10), 6);
        assert_eq!(policy.scale_down(3), 1);
        assert_eq!(policy.scale_up(0), 4);
    }

    #[test]
    fn zero_needs_explicit_opt_in() {
        let mut policy = ReplicaScalingPolicy {
            min: 0,
            max: 10,
            step: 5,
            cooldown: Duration::ZERO,
            zero_scale_allowed: false,
        };
        assert_eq!(policy.scale_down(3), 1);
        policy.zero_scale_allowed = true;
        assert_eq!(policy.scale_down(3), 0);
    }
}
