//! Function resolution: identity → backend endpoint.
//!
//! The resolver keeps an `identity → ReplicaSet` snapshot map. A snapshot is
//! fetched from the orchestrator on first use and whenever it is older than
//! the TTL; failures invalidate it so the next request refetches. Selection
//! over a snapshot is lock-free apart from the read lock on the map.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use fngate_core::{
    FunctionIdentity, FunctionProvider, FunctionStatus, GatewayConfig, GatewayError,
    ReplicaEndpoint,
};
use fngate_health::HealthRegistry;
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use crate::pool::PoolKey;

const NOT_READY_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Route to replica endpoints when the orchestrator reports them.
    pub direct: bool,
    pub vip_suffix: String,
    pub function_port: u16,
    pub cache_ttl: Duration,
    pub not_ready_grace: Duration,
}

impl From<&GatewayConfig> for ResolverConfig {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            direct: config.resolver.direct_functions,
            vip_suffix: config.resolver.direct_functions_suffix.clone(),
            function_port: config.resolver.function_port,
            cache_ttl: config.resolver.cache_ttl,
            not_ready_grace: config.resolver.not_ready_grace,
        }
    }
}

/// Per-request selection hints.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Pick by stable hash of this key instead of round-robin.
    pub sticky: Option<String>,
    /// Never pick this backend.
    pub exclude: Option<PoolKey>,
}

impl Selection {
    pub fn sticky(key: impl Into<String>) -> Self {
        Self {
            sticky: Some(key.into()),
            exclude: None,
        }
    }

    pub fn excluding(mut self, key: PoolKey) -> Self {
        self.exclude = Some(key);
        self
    }
}

/// Where one request should go.
#[derive(Debug, Clone)]
pub struct ResolvedEndpoint {
    pub key: PoolKey,
    /// The chosen replica; `None` when routing to the service VIP.
    pub replica: Option<ReplicaEndpoint>,
    pub status: Arc<FunctionStatus>,
}

impl ResolvedEndpoint {
    pub fn address(&self) -> String {
        self.key.authority()
    }

    pub fn is_direct(&self) -> bool {
        self.replica.is_some()
    }
}

struct ReplicaSet {
    status: Arc<FunctionStatus>,
    fetched_at: Instant,
    cursor: AtomicUsize,
}

pub struct Resolver {
    provider: Arc<dyn FunctionProvider>,
    health: HealthRegistry,
    config: ResolverConfig,
    cache: RwLock<HashMap<FunctionIdentity, Arc<ReplicaSet>>>,
}

impl Resolver {
    pub fn new(
        provider: Arc<dyn FunctionProvider>,
        health: HealthRegistry,
        config: ResolverConfig,
    ) -> Self {
        Self {
            provider,
            health,
            config,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn provider(&self) -> &Arc<dyn FunctionProvider> {
        &self.provider
    }

    /// Resolve `identity` to a backend.
    ///
    /// Errors: `NotFound` when the orchestrator has no such deployment,
    /// `NotReady` when it has no ready replica left after health filtering.
    pub async fn resolve(
        &self,
        identity: &FunctionIdentity,
        selection: &Selection,
    ) -> Result<ResolvedEndpoint, GatewayError> {
        let set = self.replica_set(identity).await?;
        self.select(identity, &set, selection)
    }

    /// Like [`resolve`](Self::resolve), but waits out `NotReady` for up to
    /// the configured grace period, never past `deadline`.
    pub async fn resolve_until_ready(
        &self,
        identity: &FunctionIdentity,
        selection: &Selection,
        deadline: Instant,
    ) -> Result<ResolvedEndpoint, GatewayError> {
        let give_up = deadline.min(Instant::now() + self.config.not_ready_grace);
        loop {
            match self.resolve(identity, selection).await {
                Err(GatewayError::NotReady(_)) if Instant::now() + NOT_READY_POLL < give_up => {
                    trace!(function = %identity, "waiting for a ready replica");
                    self.invalidate(identity);
                    tokio::time::sleep(NOT_READY_POLL).await;
                }
                other => return other,
            }
        }
    }

    /// Cached orchestrator status, fetching it if needed.
    pub async fn status(&self, identity: &FunctionIdentity) -> Result<Arc<FunctionStatus>, GatewayError> {
        Ok(self.replica_set(identity).await?.status.clone())
    }

    /// Drop the cached snapshot so the next call refetches.
    pub fn invalidate(&self, identity: &FunctionIdentity) {
        let mut cache = self.cache.write().expect("resolver lock");
        if cache.remove(identity).is_some() {
            debug!(function = %identity, "resolver entry invalidated");
        }
    }

    /// Replace every snapshot in `namespace` with `statuses`.
    ///
    /// Functions missing from `statuses` are dropped from the cache.
    pub fn install(&self, namespace: &str, statuses: Vec<FunctionStatus>) -> usize {
        let now = Instant::now();
        let mut cache = self.cache.write().expect("resolver lock");
        let mut fresh = HashMap::with_capacity(statuses.len());
        for status in statuses {
            let Ok(identity) = FunctionIdentity::new(&status.name, Some(namespace), namespace)
            else {
                continue;
            };
            let cursor = cache
                .get(&identity)
                .map(|s| s.cursor.load(Ordering::Relaxed))
                .unwrap_or(0);
            fresh.insert(
                identity,
                Arc::new(ReplicaSet {
                    status: Arc::new(status),
                    fetched_at: now,
                    cursor: AtomicUsize::new(cursor),
                }),
            );
        }
        cache.retain(|identity, _| identity.namespace != namespace);
        let installed = fresh.len();
        cache.extend(fresh);
        installed
    }

    async fn replica_set(&self, identity: &FunctionIdentity) -> Result<Arc<ReplicaSet>, GatewayError> {
        {
            let cache = self.cache.read().expect("resolver lock");
            if let Some(set) = cache.get(identity) {
                if set.fetched_at.elapsed() < self.config.cache_ttl {
                    return Ok(set.clone());
                }
            }
        }

        let status = match self.provider.lookup(identity).await {
            Ok(status) => status,
            Err(e) => {
                self.invalidate(identity);
                return Err(e.into());
            }
        };

        let mut cache = self.cache.write().expect("resolver lock");
        let cursor = cache
            .get(identity)
            .map(|s| s.cursor.load(Ordering::Relaxed))
            .unwrap_or(0);
        let set = Arc::new(ReplicaSet {
            status: Arc::new(status),
            fetched_at: Instant::now(),
            cursor: AtomicUsize::new(cursor),
        });
        cache.insert(identity.clone(), set.clone());
        Ok(set)
    }

    fn select(
        &self,
        identity: &FunctionIdentity,
        set: &ReplicaSet,
        selection: &Selection,
    ) -> Result<ResolvedEndpoint, GatewayError> {
        let status = &set.status;
        if status.available_replicas == 0 {
            return Err(GatewayError::NotReady(identity.to_string()));
        }

        if !self.config.direct || status.endpoints.is_empty() {
            return Ok(ResolvedEndpoint {
                key: PoolKey::http(self.vip_host(identity), self.config.function_port),
                replica: None,
                status: status.clone(),
            });
        }

        let candidates: Vec<(&ReplicaEndpoint, PoolKey)> = status
            .endpoints
            .iter()
            .filter(|r| r.weight > 0)
            .map(|r| (r, PoolKey::http(r.host.clone(), r.port)))
            .filter(|(r, key)| {
                selection.exclude.as_ref() != Some(key) && self.health.is_routable(&r.address())
            })
            .collect();

        let total: u64 = candidates.iter().map(|(r, _)| u64::from(r.weight)).sum();
        if total == 0 {
            return Err(GatewayError::NotReady(identity.to_string()));
        }

        let ticket = match &selection.sticky {
            Some(key) => stable_hash(key) % total,
            None => set.cursor.fetch_add(1, Ordering::Relaxed) as u64 % total,
        };

        let mut remaining = ticket;
        for (replica, key) in candidates {
            let weight = u64::from(replica.weight);
            if remaining < weight {
                return Ok(ResolvedEndpoint {
                    key,
                    replica: Some(replica.clone()),
                    status: status.clone(),
                });
            }
            remaining -= weight;
        }
        Err(GatewayError::NotReady(identity.to_string()))
    }

    fn vip_host(&self, identity: &FunctionIdentity) -> String {
        if self.config.vip_suffix.is_empty() {
            format!("{}.{}", identity.name, identity.namespace)
        } else {
            format!(
                "{}.{}.{}",
                identity.name,
                identity.namespace,
                self.config.vip_suffix.trim_start_matches('.')
            )
        }
    }
}

fn stable_hash(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut first = [0u8; 8];
    first.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(first)
}
