//! Keep-alive HTTP/1 connection pool.
//!
//! Connections are keyed by scheme + host + port. A connection is either
//! idle (owned by the pool) or checked out (owned by exactly one caller as
//! a [`PooledConnection`]); it is never shared. Releasing a connection puts
//! it back on its host's idle stack if the idle caps allow, otherwise it is
//! closed.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fngate_core::GatewayError;
use fngate_core::config::PoolSettings;
use hyper::body::Incoming;
use hyper::client::conn::TrySendError;
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::body::UpstreamBody;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl PoolKey {
    pub fn http(host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: "http".to_string(),
            host: host.into(),
            port,
        }
    }

    /// `host:port`, used for dialing and as the `Host` header.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Pool caps. A zero cap means unlimited.
#[derive(Debug, Clone)]
pub struct PoolLimits {
    pub max_idle: usize,
    pub max_idle_per_host: usize,
    pub max_active_per_host: usize,
    pub idle_timeout: Duration,
}

impl From<&PoolSettings> for PoolLimits {
    fn from(settings: &PoolSettings) -> Self {
        Self {
            max_idle: settings.max_idle_conns,
            max_idle_per_host: settings.max_idle_conns_per_host,
            max_active_per_host: settings.max_conns_per_host,
            idle_timeout: settings.idle_conn_timeout,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("connection limit reached for {0}")]
    Exhausted(String),

    #[error("connecting to {addr}: {reason}")]
    Connect { addr: String, reason: String },

    #[error("deadline elapsed connecting to {0}")]
    Timeout(String),
}

impl From<PoolError> for GatewayError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::Exhausted(key) => GatewayError::PoolExhausted(key),
            PoolError::Connect { .. } => GatewayError::UpstreamFailure(e.to_string()),
            PoolError::Timeout(_) => GatewayError::Timeout(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub active: usize,
    pub dialed: u64,
    pub reused: u64,
}

// ── Shared state ───────────────────────────────────────────────

struct Idle {
    sender: SendRequest<UpstreamBody>,
    since: Instant,
}

#[derive(Default)]
struct HostSlots {
    idle: Vec<Idle>,
    active: usize,
}

#[derive(Default)]
struct PoolState {
    hosts: HashMap<PoolKey, HostSlots>,
    total_idle: usize,
}

struct PoolShared {
    limits: PoolLimits,
    state: Mutex<PoolState>,
    dialed: AtomicU64,
    reused: AtomicU64,
}

impl PoolShared {
    fn is_expired(&self, idle: &Idle, now: Instant) -> bool {
        idle.sender.is_closed() || now.duration_since(idle.since) > self.limits.idle_timeout
    }
}

#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    pub fn new(limits: PoolLimits) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                limits,
                state: Mutex::new(PoolState::default()),
                dialed: AtomicU64::new(0),
                reused: AtomicU64::new(0),
            }),
        }
    }

    pub fn limits(&self) -> &PoolLimits {
        &self.shared.limits
    }

    /// Check out a connection to `key`, reusing an idle one when possible.
    ///
    /// Taking an idle connection never suspends. Dialing a new one is
    /// bounded by `deadline`.
    pub async fn get(&self, key: &PoolKey, deadline: Instant) -> Result<PooledConnection, PoolError> {
        self.checkout(key, deadline, true).await
    }

    /// Check out a freshly dialed connection, bypassing the idle stack.
    pub async fn connect(
        &self,
        key: &PoolKey,
        deadline: Instant,
    ) -> Result<PooledConnection, PoolError> {
        self.checkout(key, deadline, false).await
    }

    async fn checkout(
        &self,
        key: &PoolKey,
        deadline: Instant,
        allow_idle: bool,
    ) -> Result<PooledConnection, PoolError> {
        if Instant::now() >= deadline {
            return Err(PoolError::Timeout(key.authority()));
        }

        {
            let now = Instant::now();
            let mut state = self.shared.state.lock().expect("pool lock");
            let state = &mut *state;
            let slots = state.hosts.entry(key.clone()).or_default();

            if allow_idle {
                while let Some(idle) = slots.idle.pop() {
                    state.total_idle -= 1;
                    if self.shared.is_expired(&idle, now) {
                        continue;
                    }
                    slots.active += 1;
                    self.shared.reused.fetch_add(1, Ordering::Relaxed);
                    trace!(%key, "reusing idle connection");
                    return Ok(PooledConnection::new(key.clone(), idle.sender, &self.shared, true));
                }
            }

            let cap = self.shared.limits.max_active_per_host;
            if cap > 0 && slots.active + slots.idle.len() >= cap {
                debug!(%key, active = slots.active, cap, "connection pool exhausted");
                return Err(PoolError::Exhausted(key.to_string()));
            }
            // Reserve the slot before dialing so concurrent callers see it.
            slots.active += 1;
        }

        match dial(key, deadline).await {
            Ok(sender) => {
                self.shared.dialed.fetch_add(1, Ordering::Relaxed);
                Ok(PooledConnection::new(key.clone(), sender, &self.shared, false))
            }
            Err(e) => {
                Lease {
                    key: key.clone(),
                    shared: self.shared.clone(),
                }
                .end();
                Err(e)
            }
        }
    }

    /// Return a connection to the pool. Same as [`PooledConnection::release`].
    pub fn release(&self, conn: PooledConnection) {
        conn.release();
    }

    /// Drop idle connections that are closed or older than the idle timeout.
    /// Returns how many were removed.
    pub fn reap_idle(&self) -> usize {
        let now = Instant::now();
        let mut state = self.shared.state.lock().expect("pool lock");
        let state = &mut *state;
        let mut reaped = 0;
        for slots in state.hosts.values_mut() {
            let before = slots.idle.len();
            slots.idle.retain(|idle| !self.shared.is_expired(idle, now));
            reaped += before - slots.idle.len();
        }
        state.total_idle -= reaped;
        state
            .hosts
            .retain(|_, slots| slots.active > 0 || !slots.idle.is_empty());
        if reaped > 0 {
            debug!(reaped, idle = state.total_idle, "reaped idle connections");
        }
        reaped
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock().expect("pool lock");
        PoolStats {
            idle: state.total_idle,
            active: state.hosts.values().map(|s| s.active).sum(),
            dialed: self.shared.dialed.load(Ordering::Relaxed),
            reused: self.shared.reused.load(Ordering::Relaxed),
        }
    }

    /// Reap idle connections periodically until `shutdown` flips.
    pub fn spawn_reaper(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let pool = self.clone();
        let every = (self.shared.limits.idle_timeout / 2).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        pool.reap_idle();
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}

async fn dial(key: &PoolKey, deadline: Instant) -> Result<SendRequest<UpstreamBody>, PoolError> {
    let addr = key.authority();
    let deadline = tokio::time::Instant::from_std(deadline);

    let stream = match tokio::time::timeout_at(deadline, tokio::net::TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(PoolError::Connect {
                addr,
                reason: e.to_string(),
            });
        }
        Err(_) => return Err(PoolError::Timeout(addr)),
    };
    let _ = stream.set_nodelay(true);

    let (sender, conn) =
        match tokio::time::timeout_at(deadline, http1::handshake(TokioIo::new(stream))).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                return Err(PoolError::Connect {
                    addr,
                    reason: e.to_string(),
                });
            }
            Err(_) => return Err(PoolError::Timeout(addr)),
        };

    let conn_addr = addr.clone();
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            trace!(addr = %conn_addr, error = %e, "upstream connection closed");
        }
    });
    trace!(%addr, "dialed upstream connection");
    Ok(sender)
}

// ── Checked-out connection ─────────────────────────────────────

/// Accounts for one checked-out slot; ends it exactly once on drop.
struct Lease {
    key: PoolKey,
    shared: Arc<PoolShared>,
}

impl Lease {
    fn end(self) {}

    fn give_back(self, sender: SendRequest<UpstreamBody>) {
        if sender.is_closed() {
            return;
        }
        let limits = &self.shared.limits;
        let mut state = self.shared.state.lock().expect("pool lock");
        let state = &mut *state;
        if limits.max_idle > 0 && state.total_idle >= limits.max_idle {
            trace!(key = %self.key, "idle cap reached, closing connection");
            return;
        }
        let slots = state.hosts.entry(self.key.clone()).or_default();
        if limits.max_idle_per_host > 0 && slots.idle.len() >= limits.max_idle_per_host {
            trace!(key = %self.key, "per-host idle cap reached, closing connection");
            return;
        }
        slots.idle.push(Idle {
            sender,
            since: Instant::now(),
        });
        state.total_idle += 1;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Ok(mut state) = self.shared.state.lock() {
            if let Some(slots) = state.hosts.get_mut(&self.key) {
                slots.active = slots.active.saturating_sub(1);
            }
        }
    }
}

/// A connection owned by one caller until released or dropped.
///
/// Dropping without [`release`](Self::release) closes the connection; use
/// that for any exchange that did not finish cleanly.
pub struct PooledConnection {
    sender: SendRequest<UpstreamBody>,
    lease: Lease,
    reused: bool,
}

impl PooledConnection {
    fn new(
        key: PoolKey,
        sender: SendRequest<UpstreamBody>,
        shared: &Arc<PoolShared>,
        reused: bool,
    ) -> Self {
        Self {
            sender,
            lease: Lease {
                key,
                shared: shared.clone(),
            },
            reused,
        }
    }

    pub fn key(&self) -> &PoolKey {
        &self.lease.key
    }

    /// Whether this connection came from the idle stack.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    /// Wait until the connection can take a request.
    pub async fn ready(&mut self) -> Result<(), hyper::Error> {
        self.sender.ready().await
    }

    /// Send `request`. If the connection fails before the request is
    /// written, the error carries the request back for another attempt.
    pub async fn send(
        &mut self,
        request: http::Request<UpstreamBody>,
    ) -> Result<http::Response<Incoming>, TrySendError<http::Request<UpstreamBody>>> {
        self.sender.try_send_request(request).await
    }

    /// Hand the connection back for reuse.
    pub fn release(self) {
        let Self { sender, lease, .. } = self;
        lease.give_back(sender);
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("key", &self.lease.key)
            .field("reused", &self.reused)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use axum::Router;
    use axum::routing::get;
    use http_body_util::BodyExt;

    use super::*;
    use crate::body::{BufferedBody, RequestBody};

    async fn serve() -> (String, u16) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, Router::new().route("/", get(|| async { "pong" })))
                .await
                .unwrap();
        });
        ("127.0.0.1".to_string(), port)
    }

    fn limits() -> PoolLimits {
        PoolLimits {
            max_idle: 8,
            max_idle_per_host: 2,
            max_active_per_host: 0,
            idle_timeout: Duration::from_secs(90),
        }
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(2)
    }

    async fn exchange(conn: &mut PooledConnection) -> String {
        conn.ready().await.unwrap();
        let request = http::Request::get("/")
            .header(http::header::HOST, conn.key().authority())
            .body(BufferedBody::default().into_upstream())
            .unwrap();
        let response = conn.send(request).await.unwrap();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn released_connection_is_reused() {
        let (host, port) = serve().await;
        let pool = ConnectionPool::new(limits());
        let key = PoolKey::http(host, port);

        let mut conn = pool.get(&key, soon()).await.unwrap();
        assert!(!conn.is_reused());
        assert_eq!(exchange(&mut conn).await, "pong");
        pool.release(conn);
        assert_eq!(pool.stats().idle, 1);
        assert_eq!(pool.stats().active, 0);

        let mut conn = pool.get(&key, soon()).await.unwrap();
        assert!(conn.is_reused());
        assert_eq!(exchange(&mut conn).await, "pong");

        let stats = pool.stats();
        assert_eq!(stats.dialed, 1);
        assert_eq!(stats.reused, 1);
        assert_eq!(stats.active, 1);
    }

    #[tokio::test]
    async fn dropped_connection_is_not_pooled() {
        let (host, port) = serve().await;
        let pool = ConnectionPool::new(limits());
        let key = PoolKey::http(host, port);

        let conn = pool.get(&key, soon()).await.unwrap();
        drop(conn);
        assert_eq!(pool.stats(), PoolStats { idle: 0, active: 0, dialed: 1, reused: 0 });
    }

    #[tokio::test]
    async fn per_host_idle_cap_is_enforced() {
        let (host, port) = serve().await;
        let pool = ConnectionPool::new(limits());
        let key = PoolKey::http(host, port);

        let mut held = Vec::new();
        for _ in 0..3 {
            let mut conn = pool.get(&key, soon()).await.unwrap();
            exchange(&mut conn).await;
            held.push(conn);
        }
        for conn in held {
            conn.release();
        }
        assert_eq!(pool.stats().idle, 2);
    }

    #[tokio::test]
    async fn active_cap_reports_exhaustion() {
        let (host, port) = serve().await;
        let pool = ConnectionPool::new(PoolLimits {
            max_active_per_host: 1,
            ..limits()
        });
        let key = PoolKey::http(host, port);

        let first = pool.get(&key, soon()).await.unwrap();
        let err = pool.get(&key, soon()).await.unwrap_err();
        assert!(matches!(err, PoolError::Exhausted(_)));
        assert!(matches!(GatewayError::from(err), GatewayError::PoolExhausted(_)));

        drop(first);
        assert!(pool.get(&key, soon()).await.is_ok());
    }

    #[tokio::test]
    async fn redial_succeeds_once_the_stale_connection_is_dropped() {
        let (host, port) = serve().await;
        let pool = ConnectionPool::new(PoolLimits {
            max_active_per_host: 1,
            ..limits()
        });
        let key = PoolKey::http(host, port);

        let stale = pool.get(&key, soon()).await.unwrap();
        let err = pool.connect(&key, soon()).await.unwrap_err();
        assert!(matches!(err, PoolError::Exhausted(_)));

        drop(stale);
        let mut fresh = pool.connect(&key, soon()).await.unwrap();
        assert!(!fresh.is_reused());
        assert_eq!(exchange(&mut fresh).await, "pong");
    }

    #[tokio::test]
    async fn reap_drops_expired_idle_connections() {
        let (host, port) = serve().await;
        let pool = ConnectionPool::new(PoolLimits {
            idle_timeout: Duration::ZERO,
            ..limits()
        });
        let key = PoolKey::http(host, port);

        let mut conn = pool.get(&key, soon()).await.unwrap();
        exchange(&mut conn).await;
        conn.release();
        assert_eq!(pool.stats().idle, 1);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(pool.reap_idle(), 1);
        assert_eq!(pool.stats().idle, 0);
    }

    #[tokio::test]
    async fn dial_failure_frees_the_slot() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let pool = ConnectionPool::new(PoolLimits {
            max_active_per_host: 1,
            ..limits()
        });
        let key = PoolKey::http("127.0.0.1", port);
        for _ in 0..2 {
            let err = pool.get(&key, soon()).await.unwrap_err();
            assert!(matches!(err, PoolError::Connect { .. }));
        }
        assert_eq!(pool.stats().active, 0);
    }

    #[tokio::test]
    async fn elapsed_deadline_fails_fast() {
        let pool = ConnectionPool::new(limits());
        let err = pool
            .get(&PoolKey::http("127.0.0.1", 9), Instant::now())
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Timeout(_)));
    }
}
