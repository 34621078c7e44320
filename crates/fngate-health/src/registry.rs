//! Shared replica health registry.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use fngate_core::ReplicaHealth;
use tracing::{info, warn};

use crate::tracker::{HealthPolicy, ProbeResult, ReplicaTracker};

/// Health of every replica the gateway has talked to, keyed by `host:port`.
///
/// Cheap to clone; clones share state. Lookups take a read lock only.
#[derive(Clone)]
pub struct HealthRegistry {
    trackers: Arc<RwLock<HashMap<String, ReplicaTracker>>>,
    policy: HealthPolicy,
}

impl HealthRegistry {
    pub fn new(policy: HealthPolicy) -> Self {
        Self {
            trackers: Arc::new(RwLock::new(HashMap::new())),
            policy,
        }
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    /// Current health; unknown replicas count as ready.
    pub fn status(&self, address: &str) -> ReplicaHealth {
        let trackers = self.trackers.read().expect("health lock");
        trackers
            .get(address)
            .map(|t| t.health_at(Instant::now()))
            .unwrap_or(ReplicaHealth::Ready)
    }

    pub fn is_routable(&self, address: &str) -> bool {
        self.status(address).is_routable()
    }

    pub fn record_success(&self, address: &str) -> ReplicaHealth {
        self.update(address, |t, now| t.record_success(now))
    }

    pub fn record_failure(&self, address: &str) -> ReplicaHealth {
        self.update(address, |t, now| t.record_failure(now))
    }

    pub fn record_protocol_violation(&self, address: &str) -> ReplicaHealth {
        self.update(address, |t, now| t.record_protocol_violation(now))
    }

    pub fn record_probe(&self, address: &str, result: ProbeResult) -> ReplicaHealth {
        self.update(address, |t, now| t.record_probe(result, now))
    }

    /// Delay before the next active probe of `address`.
    pub fn next_probe_interval(&self, address: &str) -> Duration {
        let trackers = self.trackers.read().expect("health lock");
        trackers
            .get(address)
            .map(ReplicaTracker::next_probe_interval)
            .unwrap_or(self.policy.probe_interval)
    }

    /// Forget replicas the orchestrator no longer reports.
    pub fn retain(&self, live: &HashSet<String>) {
        let mut trackers = self.trackers.write().expect("health lock");
        trackers.retain(|address, _| live.contains(address));
    }

    /// `(address, health)` for every tracked replica, sorted by address.
    pub fn snapshot(&self) -> Vec<(String, ReplicaHealth)> {
        let now = Instant::now();
        let trackers = self.trackers.read().expect("health lock");
        let mut entries: Vec<_> = trackers
            .iter()
            .map(|(address, t)| (address.clone(), t.health_at(now)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    fn update<F>(&self, address: &str, f: F) -> ReplicaHealth
    where
        F: FnOnce(&mut ReplicaTracker, Instant) -> ReplicaHealth,
    {
        let now = Instant::now();
        let mut trackers = self.trackers.write().expect("health lock");
        let tracker = trackers
            .entry(address.to_string())
            .or_insert_with(|| ReplicaTracker::new(self.policy.clone()));

        let before = tracker.health_at(now);
        let after = f(tracker, now);
        if before != after {
            match after {
                ReplicaHealth::Ready => info!(%address, ?before, "replica ready"),
                ReplicaHealth::Unready => warn!(%address, ?before, "replica unready"),
                ReplicaHealth::Quarantined => warn!(
                    %address,
                    cooldown_secs = self.policy.quarantine_cooldown.as_secs(),
                    "replica quarantined"
                ),
            }
        }
        after
    }
}
