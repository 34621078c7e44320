//! Process wiring: open the queue, pick the orchestrator driver, start the
//! background loops, and shut everything down in order.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use fngate_api::{Gateway, build_router, control_client};
use fngate_core::{FunctionProvider, GatewayConfig, MemoryProvider};
use fngate_health::ProbeMonitor;
use fngate_proxy::{HttpProvider, ReplicaSync};
use fngate_queue::{Broker, RedbBroker};
use fngate_worker::{HttpCallbackSender, QueueWorker, WorkerConfig, WorkerReport};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DEPTH_FEED_INTERVAL: Duration = Duration::from_secs(1);

// ── Modes ──────────────────────────────────────────────────────

/// `queues` is `None` when this process only accepts async invocations.
pub async fn serve(config: GatewayConfig, queues: Option<Vec<String>>) -> anyhow::Result<()> {
    info!(port = config.port, worker = queues.is_some(), "fngate starting");
    let gateway = assemble(config)?;
    let config = gateway.config.clone();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let cancel = gateway.shutdown.clone();

    // ── Background tasks ───────────────────────────────────────

    let probes = config.health.probes_enabled.then(|| {
        Arc::new(ProbeMonitor::new(
            gateway.health.clone(),
            &config.health.probe_path,
            config.health.probe_timeout,
        ))
    });
    let sync = ReplicaSync::new(
        gateway.provider.clone(),
        gateway.resolver.clone(),
        probes,
        vec![config.default_namespace.clone()],
    );
    let sync_handle = tokio::spawn(sync.run(config.reconcile_interval, shutdown_rx.clone()));
    let reaper_handle = gateway.proxy.pool().spawn_reaper(shutdown_rx.clone());
    let depth_handle = tokio::spawn(
        gateway
            .clone()
            .run_depth_feed(DEPTH_FEED_INTERVAL, shutdown_rx.clone()),
    );
    let workers = match &queues {
        Some(extra) => spawn_workers(&gateway, extra, &cancel),
        None => Vec::new(),
    };

    // ── HTTP ───────────────────────────────────────────────────

    let router = build_router(gateway.clone());
    let liveness = gateway.liveness.clone();
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    gateway.liveness.mark_ready();
    info!(%addr, "gateway listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        liveness.mark_draining();
        let _ = shutdown_tx.send(true);
        cancel.cancel();
    })
    .await
    .context("serving http")?;

    join_workers(workers).await?;
    let _ = sync_handle.await;
    let _ = reaper_handle.await;
    let _ = depth_handle.await;

    info!("fngate stopped");
    Ok(())
}

pub async fn work(config: GatewayConfig, queues: Vec<String>) -> anyhow::Result<()> {
    let gateway = assemble(config)?;
    let cancel = gateway.shutdown.clone();
    let workers = spawn_workers(&gateway, &queues, &cancel);

    shutdown_signal().await;
    info!("shutdown signal received");
    cancel.cancel();
    join_workers(workers).await
}

pub async fn dead_letters(config: GatewayConfig, limit: usize) -> anyhow::Result<()> {
    let broker = open_broker(&config)?;
    let records = broker
        .dead_letters(limit)
        .await
        .context("reading dead letters")?;
    for record in &records {
        println!("{}", serde_json::to_string(record)?);
    }
    info!(count = records.len(), "dead letters listed");
    Ok(())
}

// ── Wiring ─────────────────────────────────────────────────────

fn assemble(config: GatewayConfig) -> anyhow::Result<Arc<Gateway>> {
    let broker = open_broker(&config)?;
    let provider = provider_for(&config);
    Ok(Arc::new(Gateway::build(config, provider, broker)))
}

fn open_broker(config: &GatewayConfig) -> anyhow::Result<Arc<RedbBroker>> {
    let path = &config.queue.path;
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating queue directory {}", dir.display()))?;
    }
    let broker = RedbBroker::open(path, config.queue.visibility_timeout)
        .with_context(|| format!("opening queue at {}", path.display()))?;
    info!(path = %path.display(), "queue opened");
    Ok(Arc::new(broker))
}

fn provider_for(config: &GatewayConfig) -> Arc<dyn FunctionProvider> {
    match config.functions_provider_url.as_deref() {
        Some(url) => {
            info!(%url, "using remote orchestrator");
            Arc::new(HttpProvider::new(url, control_client(config)))
        }
        None => {
            warn!("no functions_provider_url set, using the in-process provider");
            Arc::new(MemoryProvider::new(&config.default_namespace))
        }
    }
}

/// One worker pool for the default queue plus one per extra queue name.
fn spawn_workers(
    gateway: &Gateway,
    extra: &[String],
    cancel: &CancellationToken,
) -> Vec<(String, JoinHandle<WorkerReport>)> {
    let mut queues = vec![gateway.publisher.default_queue()];
    for name in extra {
        let queue = format!("{}{}", gateway.config.queue.name_prefix, name);
        if !queues.contains(&queue) {
            queues.push(queue);
        }
    }

    let callbacks = Arc::new(HttpCallbackSender::new(gateway.client.clone()));
    queues
        .into_iter()
        .map(|queue| {
            let worker = Arc::new(QueueWorker::new(
                gateway.broker.clone(),
                gateway.invoker(),
                callbacks.clone(),
                WorkerConfig::from_gateway(&gateway.config, queue.clone()),
            ));
            info!(%queue, "queue worker started");
            (queue, tokio::spawn(worker.run(cancel.clone())))
        })
        .collect()
}

async fn join_workers(workers: Vec<(String, JoinHandle<WorkerReport>)>) -> anyhow::Result<()> {
    for (queue, handle) in workers {
        let report = handle
            .await
            .with_context(|| format!("worker task for {queue}"))?;
        log_report(&queue, report);
    }
    Ok(())
}

fn log_report(queue: &str, report: WorkerReport) {
    info!(
        %queue,
        received = report.received,
        acked = report.acked,
        retried = report.retried,
        dead_lettered = report.dead_lettered,
        parked = report.parked,
        released = report.released,
        abandoned = report.abandoned,
        broker_errors = report.broker_errors,
        "queue worker stopped"
    );
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
