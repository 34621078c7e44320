//! Periodic reconciliation of the resolver against the orchestrator view.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use fngate_core::FunctionProvider;
use fngate_health::ProbeMonitor;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::resolver::Resolver;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub functions: usize,
    pub replicas: usize,
    pub failed_namespaces: usize,
}

pub struct ReplicaSync {
    provider: Arc<dyn FunctionProvider>,
    resolver: Arc<Resolver>,
    probes: Option<Arc<ProbeMonitor>>,
    namespaces: Vec<String>,
}

impl ReplicaSync {
    pub fn new(
        provider: Arc<dyn FunctionProvider>,
        resolver: Arc<Resolver>,
        probes: Option<Arc<ProbeMonitor>>,
        namespaces: Vec<String>,
    ) -> Self {
        Self {
            provider,
            resolver,
            probes,
            namespaces,
        }
    }

    /// One reconciliation pass over every configured namespace.
    ///
    /// A namespace that fails to list keeps its previous snapshot, and its
    /// replicas stay probed.
    pub async fn sync_once(&self) -> SyncStats {
        let mut stats = SyncStats::default();
        let mut targets = HashSet::new();
        let direct = self.resolver.config().direct;

        for namespace in &self.namespaces {
            match self.provider.list(namespace).await {
                Ok(statuses) => {
                    for status in &statuses {
                        stats.replicas += status.endpoints.len();
                        if direct {
                            targets.extend(status.endpoints.iter().map(|e| e.address()));
                        }
                    }
                    stats.functions += self.resolver.install(namespace, statuses);
                }
                Err(e) => {
                    stats.failed_namespaces += 1;
                    warn!(%namespace, error = %e, "listing functions failed");
                }
            }
        }

        if let Some(probes) = &self.probes {
            if stats.failed_namespaces == 0 {
                probes.reconcile(&targets);
            } else {
                // Keep probing what we knew about rather than dropping it.
                let mut merged: HashSet<String> = probes.active().into_iter().collect();
                merged.extend(targets);
                probes.reconcile(&merged);
            }
        }

        debug!(
            functions = stats.functions,
            replicas = stats.replicas,
            failed = stats.failed_namespaces,
            "replica sync complete"
        );
        stats
    }

    /// Reconcile every `interval` until `shutdown` flips.
    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = interval.as_millis() as u64,
            namespaces = ?self.namespaces,
            "replica sync started"
        );
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sync_once().await;
                }
                _ = shutdown.changed() => break,
            }
        }
        if let Some(probes) = &self.probes {
            probes.stop_all();
        }
        info!("replica sync stopped");
    }
}

#[cfg(test)]
mod tests {
    use fngate_core::{
        DEFAULT_NAMESPACE, FunctionIdentity, FunctionStatus, GatewayConfig, MemoryProvider,
        ReplicaEndpoint,
    };
    use fngate_health::{HealthPolicy, HealthRegistry};

    use super::*;
    use crate::resolver::{ResolverConfig, Selection};

    #[tokio::test]
    async fn installs_statuses_and_probe_targets() {
        let provider = Arc::new(MemoryProvider::new(DEFAULT_NAMESPACE));
        provider
            .insert(FunctionStatus {
                name: "echo".into(),
                replicas: 1,
                available_replicas: 1,
                endpoints: vec![ReplicaEndpoint::new("10.0.0.7", 8080)],
                ..Default::default()
            })
            .unwrap();

        let config = GatewayConfig::default();
        let health = HealthRegistry::new(HealthPolicy::from(&config.health));
        let resolver = Arc::new(Resolver::new(
            provider.clone(),
            health.clone(),
            ResolverConfig {
                direct: true,
                ..ResolverConfig::from(&config)
            },
        ));
        let probes = Arc::new(ProbeMonitor::new(health, "/_/health", Duration::from_secs(1)));
        let sync = ReplicaSync::new(
            provider.clone(),
            resolver.clone(),
            Some(probes.clone()),
            vec![DEFAULT_NAMESPACE.to_string()],
        );

        let stats = sync.sync_once().await;
        assert_eq!(
            stats,
            SyncStats {
                functions: 1,
                replicas: 1,
                failed_namespaces: 0
            }
        );
        assert_eq!(probes.active(), vec!["10.0.0.7:8080".to_string()]);

        let echo = FunctionIdentity::parse("echo", DEFAULT_NAMESPACE).unwrap();
        let endpoint = resolver.resolve(&echo, &Selection::default()).await.unwrap();
        assert_eq!(endpoint.address(), "10.0.0.7:8080");
        // Served from the installed snapshot.
        assert_eq!(provider.lookup_count(), 0);

        provider.delete(&echo).await.unwrap();
        sync.sync_once().await;
        assert!(probes.active().is_empty());
        probes.stop_all();
    }
}
