//! Gateway assembly: every component built once from the config snapshot
//! and shared by the HTTP handlers, the queue worker and the background
//! loops.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fngate_admission::{Admission, AdmissionLimits};
use fngate_autoscale::{AlertScaler, ZeroScaler};
use fngate_core::{FanOut, FunctionProvider, GatewayConfig, GatewayError, LogObserver, Observer};
use fngate_health::{HealthPolicy, HealthRegistry, Liveness};
use fngate_metrics::{GatewayGauges, MetricsCollector};
use fngate_proxy::{
    BufferedBody, ConnectionPool, HttpClient, InvocationProxy, InvocationRequest,
    InvocationResponse, Invoker, PoolLimits, Resolver, ResolverConfig,
};
use fngate_queue::{Broker, Publisher, PublisherConfig};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct Gateway {
    pub config: Arc<GatewayConfig>,
    pub provider: Arc<dyn FunctionProvider>,
    pub health: HealthRegistry,
    pub resolver: Arc<Resolver>,
    pub proxy: Arc<InvocationProxy>,
    pub admission: Admission,
    pub broker: Arc<dyn Broker>,
    pub publisher: Arc<Publisher>,
    pub scaler: Arc<AlertScaler>,
    /// Present when `scale_from_zero` is on.
    pub zero: Option<Arc<ZeroScaler>>,
    pub metrics: Arc<MetricsCollector>,
    /// Reported by `/healthz`; the daemon flips it around the serve loop.
    pub liveness: Liveness,
    /// Control-plane client: auth delegate and callbacks.
    pub client: HttpClient,
    pub shutdown: CancellationToken,
}

impl Gateway {
    pub fn build(
        config: GatewayConfig,
        provider: Arc<dyn FunctionProvider>,
        broker: Arc<dyn Broker>,
    ) -> Self {
        let config = Arc::new(config);
        let health = HealthRegistry::new(HealthPolicy::from(&config.health));
        let resolver = Arc::new(Resolver::new(
            provider.clone(),
            health.clone(),
            ResolverConfig::from(config.as_ref()),
        ));

        let metrics = Arc::new(MetricsCollector::new());
        let observers: Vec<Arc<dyn Observer>> = vec![
            Arc::new(LogObserver) as Arc<dyn Observer>,
            metrics.clone() as Arc<dyn Observer>,
        ];
        let observer = Arc::new(FanOut(observers));
        let proxy = Arc::new(InvocationProxy::new(
            resolver.clone(),
            ConnectionPool::new(PoolLimits::from(&config.pool)),
            health.clone(),
            observer,
        ));

        let shutdown = CancellationToken::new();
        let scaler = Arc::new(
            AlertScaler::new(
                provider.clone(),
                config.scaling.clone(),
                &config.default_namespace,
            )
            .with_shutdown(shutdown.clone()),
        );
        let zero = config.scale_from_zero.then(|| {
            Arc::new(ZeroScaler::new(
                resolver.clone(),
                config.scaling.clone(),
                config.scale_from_zero_grace,
            ))
        });

        let publisher = Arc::new(Publisher::new(
            broker.clone(),
            PublisherConfig::from(config.as_ref()),
        ));

        info!(
            namespace = %config.default_namespace,
            direct = config.resolver.direct_functions,
            scale_from_zero = config.scale_from_zero,
            auth = config.auth_proxy_url.is_some(),
            "gateway assembled"
        );

        Self {
            admission: Admission::new(AdmissionLimits::from(&config.admission)),
            client: control_client(&config),
            config,
            provider,
            health,
            resolver,
            proxy,
            broker,
            publisher,
            scaler,
            zero,
            metrics,
            liveness: Liveness::new(),
            shutdown,
        }
    }

    /// The invocation capability handed to queue workers.
    pub fn invoker(&self) -> Arc<GatewayInvoker> {
        Arc::new(GatewayInvoker {
            proxy: self.proxy.clone(),
            zero: self.zero.clone(),
        })
    }

    /// Gauges rendered next to the invocation metrics.
    pub fn gauges(&self) -> GatewayGauges {
        GatewayGauges {
            inflight: self.admission.inflight(),
            inflight_per_function: self
                .admission
                .snapshot()
                .into_iter()
                .map(|(identity, n)| (identity.to_string(), n))
                .collect(),
            admission_rejected_total: self.admission.rejected_total(),
            queue_depth: self.admission.broker_depth(),
        }
    }

    /// Read the broker depth once and hand it to admission.
    pub async fn refresh_broker_depth(&self) -> Result<u64, GatewayError> {
        let depth = self.publisher.depth().await?;
        self.admission.record_broker_depth(depth);
        Ok(depth)
    }

    /// Feed broker depth to admission every `interval` until `shutdown`
    /// flips. A failed read keeps the last known depth.
    pub async fn run_depth_feed(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.refresh_broker_depth().await {
                        Ok(depth) => debug!(depth, "broker depth"),
                        Err(e) => warn!(error = %e, "reading broker depth failed"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("broker depth feed stopped");
    }
}

/// HTTP client for calls the gateway makes on its own behalf.
pub fn control_client(config: &GatewayConfig) -> HttpClient {
    HttpClient::new(
        ConnectionPool::new(PoolLimits::from(&config.pool)),
        config.upstream_timeout,
    )
}

/// Wakes the function if needed, then proxies. Used by the queue worker so
/// async invocations go through the same path as sync ones.
pub struct GatewayInvoker {
    proxy: Arc<InvocationProxy>,
    zero: Option<Arc<ZeroScaler>>,
}

#[async_trait]
impl Invoker for GatewayInvoker {
    async fn invoke(
        &self,
        request: InvocationRequest<BufferedBody>,
    ) -> Result<InvocationResponse, GatewayError> {
        if let Some(zero) = &self.zero {
            zero.ensure_ready(&request.identity, request.deadline).await?;
        }
        self.proxy.invoke(request).await
    }
}
