//! Scale from zero.
//!
//! Before a request is proxied or queued, the gateway makes sure the target
//! has at least one available replica. A function whose desired count is 0
//! is scaled to `max(min, 1)`; callers arriving while that request is in
//! flight wait on the same one. Then everyone polls until a replica is
//! available or the grace window closes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use fngate_core::config::ScalingSettings;
use fngate_core::{FunctionIdentity, GatewayError};
use fngate_proxy::Resolver;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::policy::ReplicaScalingPolicy;

const DEFAULT_POLL: Duration = Duration::from_millis(100);

type Flight = Arc<OnceCell<Result<(), String>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// A replica was already available.
    Warm,
    /// The function had to be started, or was still starting.
    Woken { waited: Duration },
}

pub struct ZeroScaler {
    resolver: Arc<Resolver>,
    settings: ScalingSettings,
    grace: Duration,
    poll_interval: Duration,
    flights: DashMap<FunctionIdentity, Flight>,
}

impl ZeroScaler {
    pub fn new(resolver: Arc<Resolver>, settings: ScalingSettings, grace: Duration) -> Self {
        Self {
            resolver,
            settings,
            grace,
            poll_interval: DEFAULT_POLL,
            flights: DashMap::new(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Wait until `identity` has an available replica, starting it if its
    /// desired count is zero. Never waits past `deadline`.
    pub async fn ensure_ready(
        &self,
        identity: &FunctionIdentity,
        deadline: Instant,
    ) -> Result<Readiness, GatewayError> {
        let started = Instant::now();
        let status = self.resolver.status(identity).await?;
        if status.available_replicas > 0 {
            return Ok(Readiness::Warm);
        }

        if status.replicas == 0 {
            let policy = ReplicaScalingPolicy::from_status(&status, &self.settings);
            self.scale_once(identity, policy.min.max(1)).await?;
        }

        let give_up = deadline.min(started + self.grace);
        loop {
            self.resolver.invalidate(identity);
            let status = self.resolver.status(identity).await?;
            if status.available_replicas > 0 {
                let waited = started.elapsed();
                info!(
                    function = %identity,
                    waited_ms = waited.as_millis() as u64,
                    "function ready after scale from zero"
                );
                return Ok(Readiness::Woken { waited });
            }
            if Instant::now() + self.poll_interval >= give_up {
                warn!(function = %identity, "no replica became available in time");
                return Err(GatewayError::NotReady(identity.to_string()));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// One scale request per function at a time; concurrent callers share
    /// its result.
    async fn scale_once(&self, identity: &FunctionIdentity, replicas: u32) -> Result<(), GatewayError> {
        let flight = self
            .flights
            .entry(identity.clone())
            .or_default()
            .clone();

        let result = flight
            .get_or_init(|| async {
                info!(function = %identity, replicas, "scaling from zero");
                let result = self
                    .resolver
                    .provider()
                    .scale(identity, replicas)
                    .await
                    .map_err(|e| e.to_string());
                self.resolver.invalidate(identity);
                result
            })
            .await
            .clone();

        self.flights
            .remove_if(identity, |_, current| Arc::ptr_eq(current, &flight));

        result.map_err(|e| {
            debug!(function = %identity, error = %e, "scale from zero failed");
            GatewayError::UpstreamFailure(format!("scaling {identity} from zero: {e}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use fngate_core::{DEFAULT_NAMESPACE, FunctionStatus, GatewayConfig, MemoryProvider};
    use fngate_health::{HealthPolicy, HealthRegistry};
    use fngate_proxy::ResolverConfig;

    use super::*;
    use crate::policy::MIN_SCALE_LABEL;

    fn setup(replicas: u32, labels: &[(&str, &str)]) -> (Arc<MemoryProvider>, ZeroScaler) {
        let provider = Arc::new(MemoryProvider::new(DEFAULT_NAMESPACE));
        provider
            .insert(FunctionStatus {
                name: "echo".into(),
                replicas,
                available_replicas: replicas,
                labels: labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                ..Default::default()
            })
            .unwrap();
        let config = GatewayConfig::default();
        let resolver = Arc::new(Resolver::new(
            provider.clone(),
            HealthRegistry::new(HealthPolicy::from(&config.health)),
            ResolverConfig::from(&config),
        ));
        let scaler = ZeroScaler::new(resolver, config.scaling.clone(), Duration::from_secs(2))
            .with_poll_interval(Duration::from_millis(10));
        (provider, scaler)
    }

    fn echo() -> FunctionIdentity {
        FunctionIdentity::parse("echo", DEFAULT_NAMESPACE).unwrap()
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn warm_function_needs_nothing() {
        let (provider, scaler) = setup(2, &[]);
        assert_eq!(scaler.ensure_ready(&echo(), soon()).await.unwrap(), Readiness::Warm);
        assert!(provider.scale_calls().is_empty());
    }

    #[tokio::test]
    async fn cold_function_is_scaled_to_min() {
        let (provider, scaler) = setup(0, &[(MIN_SCALE_LABEL, "3")]);
        let readiness = scaler.ensure_ready(&echo(), soon()).await.unwrap();
        assert!(matches!(readiness, Readiness::Woken { .. }));
        assert_eq!(provider.scale_calls(), vec![(echo(), 3)]);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_scale_request() {
        let (provider, scaler) = setup(0, &[]);
        let scaler = Arc::new(scaler);
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let scaler = scaler.clone();
            tasks.push(tokio::spawn(async move {
                scaler.ensure_ready(&echo(), soon()).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(provider.scale_calls(), vec![(echo(), 1)]);
        assert!(scaler.flights.is_empty());
    }

    #[tokio::test]
    async fn unknown_function_is_not_found() {
        let (_, scaler) = setup(1, &[]);
        let missing = FunctionIdentity::parse("missing", DEFAULT_NAMESPACE).unwrap();
        let err = scaler.ensure_ready(&missing, soon()).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[tokio::test]
    async fn gives_up_at_the_deadline() {
        let (provider, scaler) = setup(1, &[]);
        // Desired 1 but nothing running: wait, never scale.
        provider
            .insert(FunctionStatus {
                name: "echo".into(),
                replicas: 1,
                available_replicas: 0,
                ..Default::default()
            })
            .unwrap();
        let started = Instant::now();
        let err = scaler
            .ensure_ready(&echo(), Instant::now() + Duration::from_millis(60))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotReady(_)));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(provider.scale_calls().is_empty());
    }
}
