//! Active probing — one background task per known replica address.
//!
//! The set of probed addresses follows the orchestrator view: the replica
//! sync loop calls [`ProbeMonitor::reconcile`] with every address it sees,
//! new ones get a task, vanished ones are stopped.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Empty;
use hyper_util::rt::TokioIo;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::registry::HealthRegistry;
use crate::tracker::ProbeResult;

struct MonitorSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

pub struct ProbeMonitor {
    registry: HealthRegistry,
    path: String,
    timeout: Duration,
    monitors: Mutex<HashMap<String, MonitorSlot>>,
}

impl ProbeMonitor {
    pub fn new(registry: HealthRegistry, path: &str, timeout: Duration) -> Self {
        Self {
            registry,
            path: path.to_string(),
            timeout,
            monitors: Mutex::new(HashMap::new()),
        }
    }

    /// Probe exactly `targets`: start missing tasks, stop stale ones.
    pub fn reconcile(&self, targets: &HashSet<String>) {
        let mut monitors = self.monitors.lock().expect("monitors lock");

        let stale: Vec<String> = monitors
            .keys()
            .filter(|address| !targets.contains(*address))
            .cloned()
            .collect();
        for address in stale {
            if let Some(slot) = monitors.remove(&address) {
                let _ = slot.shutdown_tx.send(true);
                slot.handle.abort();
                debug!(%address, "replica probe stopped");
            }
        }

        for address in targets {
            if monitors.contains_key(address) {
                continue;
            }
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let handle = tokio::spawn(run_probe_loop(
                address.clone(),
                self.path.clone(),
                self.timeout,
                self.registry.clone(),
                shutdown_rx,
            ));
            monitors.insert(address.clone(), MonitorSlot { handle, shutdown_tx });
            debug!(%address, path = %self.path, "replica probe started");
        }

        self.registry.retain(targets);
    }

    /// Stop every probe task (for graceful shutdown).
    pub fn stop_all(&self) {
        let mut monitors = self.monitors.lock().expect("monitors lock");
        for (_, slot) in monitors.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
        }
        info!("replica probes stopped");
    }

    pub fn active(&self) -> Vec<String> {
        let monitors = self.monitors.lock().expect("monitors lock");
        let mut addresses: Vec<_> = monitors.keys().cloned().collect();
        addresses.sort();
        addresses
    }
}

impl Drop for ProbeMonitor {
    fn drop(&mut self) {
        if let Ok(mut monitors) = self.monitors.lock() {
            for (_, slot) in monitors.drain() {
                slot.handle.abort();
            }
        }
    }
}

async fn run_probe_loop(
    address: String,
    path: String,
    timeout: Duration,
    registry: HealthRegistry,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let interval = registry.next_probe_interval(&address);
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let result = http_probe(&address, &path, timeout).await;
                registry.record_probe(&address, result);
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// GET `path` on `address` over a fresh connection.
///
/// `Healthy` for 2xx, `Unhealthy` for any other status, `Failed` when the
/// connection or exchange fails or `timeout` elapses.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    match tokio::time::timeout(timeout, probe_once(address, path)).await {
        Ok(result) => result,
        Err(_) => {
            debug!(%address, %path, "replica probe timed out");
            ProbeResult::Failed
        }
    }
}

async fn probe_once(address: &str, path: &str) -> ProbeResult {
    let stream = match tokio::net::TcpStream::connect(address).await {
        Ok(s) => s,
        Err(e) => {
            debug!(error = %e, %address, "replica probe connect failed");
            return ProbeResult::Failed;
        }
    };

    let (mut sender, conn) = match hyper::client::conn::http1::handshake(TokioIo::new(stream)).await
    {
        Ok(pair) => pair,
        Err(e) => {
            debug!(error = %e, %address, "replica probe handshake failed");
            return ProbeResult::Failed;
        }
    };
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let request = match http::Request::get(path)
        .header(http::header::HOST, address)
        .header(http::header::USER_AGENT, "fngate-health/0.1")
        .body(Empty::<Bytes>::new())
    {
        Ok(r) => r,
        Err(e) => {
            debug!(error = %e, %path, "replica probe request invalid");
            return ProbeResult::Failed;
        }
    };

    match sender.send_request(request).await {
        Ok(resp) if resp.status().is_success() => ProbeResult::Healthy,
        Ok(resp) => {
            debug!(status = %resp.status(), %address, "replica probe non-2xx");
            ProbeResult::Unhealthy
        }
        Err(e) => {
            debug!(error = %e, %address, "replica probe request failed");
            ProbeResult::Failed
        }
    }
}
