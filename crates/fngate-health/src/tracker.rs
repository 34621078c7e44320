//! Per-replica health state machine.
//!
//! Every method takes the current instant so transitions are testable
//! without sleeping.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use fngate_core::ReplicaHealth;
use fngate_core::config::HealthSettings;

/// Result of a single active probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The health endpoint returned 2xx.
    Healthy,
    /// The health endpoint returned non-2xx.
    Unhealthy,
    /// The probe could not be executed (connect error or timeout).
    Failed,
}

/// Thresholds shared by every tracker.
#[derive(Debug, Clone)]
pub struct HealthPolicy {
    pub failure_threshold: u32,
    pub failure_window: Duration,
    pub recovery_probes: u32,
    pub quarantine_after: u32,
    pub quarantine_cooldown: Duration,
    /// Without probes an unready replica is retried after `failure_window`.
    pub probes_enabled: bool,
    pub probe_interval: Duration,
    pub max_backoff: Duration,
}

impl From<&HealthSettings> for HealthPolicy {
    fn from(settings: &HealthSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold.max(1),
            failure_window: settings.failure_window,
            recovery_probes: settings.recovery_probes.max(1),
            quarantine_after: settings.quarantine_after.max(1),
            quarantine_cooldown: settings.quarantine_cooldown,
            probes_enabled: settings.probes_enabled,
            probe_interval: settings.probe_interval,
            max_backoff: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReplicaTracker {
    health: ReplicaHealth,
    /// Failure instants inside the sliding window.
    failures: VecDeque<Instant>,
    violations: u32,
    probe_successes: u32,
    quarantined_until: Option<Instant>,
    unready_since: Option<Instant>,
    current_backoff: Duration,
    policy: HealthPolicy,
}

impl ReplicaTracker {
    pub fn new(policy: HealthPolicy) -> Self {
        Self {
            health: ReplicaHealth::Ready,
            failures: VecDeque::new(),
            violations: 0,
            probe_successes: 0,
            quarantined_until: None,
            unready_since: None,
            current_backoff: policy.probe_interval,
            policy,
        }
    }

    /// Effective health at `now`, accounting for elapsed cooldowns.
    pub fn health_at(&self, now: Instant) -> ReplicaHealth {
        match self.health {
            ReplicaHealth::Quarantined => match self.quarantined_until {
                Some(until) if now >= until => self.after_quarantine(until, now),
                _ => ReplicaHealth::Quarantined,
            },
            ReplicaHealth::Unready => self.unready_at(self.unready_since, now),
            ReplicaHealth::Ready => ReplicaHealth::Ready,
        }
    }

    fn after_quarantine(&self, until: Instant, now: Instant) -> ReplicaHealth {
        self.unready_at(Some(until), now)
    }

    fn unready_at(&self, since: Option<Instant>, now: Instant) -> ReplicaHealth {
        match since {
            Some(since) if !self.policy.probes_enabled && now >= since + self.policy.failure_window => {
                ReplicaHealth::Ready
            }
            _ => ReplicaHealth::Unready,
        }
    }

    /// Fold elapsed cooldowns into the stored state.
    fn settle(&mut self, now: Instant) {
        let effective = self.health_at(now);
        if self.health == ReplicaHealth::Quarantined && effective != ReplicaHealth::Quarantined {
            self.unready_since = self.quarantined_until;
            self.quarantined_until = None;
            self.violations = 0;
        }
        if effective == ReplicaHealth::Ready && self.health != ReplicaHealth::Ready {
            self.failures.clear();
            self.unready_since = None;
        }
        self.health = effective;
    }

    /// A connection-level failure observed on live traffic.
    pub fn record_failure(&mut self, now: Instant) -> ReplicaHealth {
        self.settle(now);
        self.probe_successes = 0;
        if self.health != ReplicaHealth::Ready {
            return self.health;
        }

        self.failures.push_back(now);
        while let Some(&oldest) = self.failures.front() {
            if now.duration_since(oldest) > self.policy.failure_window {
                self.failures.pop_front();
            } else {
                break;
            }
        }

        if self.failures.len() as u32 >= self.policy.failure_threshold {
            self.health = ReplicaHealth::Unready;
            self.unready_since = Some(now);
        }
        self.health
    }

    /// A successful exchange on live traffic.
    pub fn record_success(&mut self, now: Instant) -> ReplicaHealth {
        self.settle(now);
        if self.health == ReplicaHealth::Ready {
            self.failures.clear();
            self.violations = 0;
        }
        self.health
    }

    /// The replica spoke malformed HTTP or broke the connection contract.
    pub fn record_protocol_violation(&mut self, now: Instant) -> ReplicaHealth {
        self.settle(now);
        if self.health == ReplicaHealth::Quarantined {
            return self.health;
        }

        self.violations += 1;
        if self.violations >= self.policy.quarantine_after {
            self.health = ReplicaHealth::Quarantined;
            self.quarantined_until = Some(now + self.policy.quarantine_cooldown);
            self.failures.clear();
            self.probe_successes = 0;
            return self.health;
        }
        self.record_failure(now)
    }

    /// Fold in an active probe result.
    pub fn record_probe(&mut self, result: ProbeResult, now: Instant) -> ReplicaHealth {
        self.settle(now);
        match result {
            ProbeResult::Healthy => {
                self.current_backoff = self.policy.probe_interval;
                if self.health == ReplicaHealth::Unready {
                    self.probe_successes += 1;
                    if self.probe_successes >= self.policy.recovery_probes {
                        self.health = ReplicaHealth::Ready;
                        self.failures.clear();
                        self.unready_since = None;
                        self.probe_successes = 0;
                    }
                }
            }
            ProbeResult::Unhealthy | ProbeResult::Failed => {
                self.current_backoff = (self.current_backoff * 2).min(self.policy.max_backoff);
                if self.health == ReplicaHealth::Ready {
                    self.record_failure(now);
                } else {
                    self.probe_successes = 0;
                }
            }
        }
        self.health
    }

    /// Delay before the next active probe.
    pub fn next_probe_interval(&self) -> Duration {
        self.current_backoff
    }

    pub fn failures_in_window(&self) -> usize {
        self.failures.len()
    }
}
