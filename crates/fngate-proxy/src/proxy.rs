//! The invocation proxy.
//!
//! ```text
//! invoke(req)
//!   ├── deadline already past ───────────────────────▶ Timeout
//!   ├── resolve (waits out NotReady within grace)
//!   ├── pool.get → ready → try_send
//!   │     ├── stale idle connection ─▶ same replica, fresh connection
//!   │     ├── not sent (dial / refused) ─▶ one retry, another replica
//!   │     ├── sent, then failed ─▶ one retry only if idempotent + replayable
//!   │     └── headers received
//!   │           ├── 5xx, idempotent + replayable ─▶ one retry if another replica exists
//!   │           └── otherwise ─▶ stream back through ResponseBody
//!   └── deadline fires before headers ──────────────▶ Timeout (504)
//! ```
//!
//! Nothing is retried once response headers have been handed to the caller.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use fngate_core::{FunctionIdentity, GatewayError, InvocationPath, Observation, Observer};
use fngate_health::HealthRegistry;
use http::header::{self, HeaderMap, HeaderValue};
use http::{Method, Request, Response};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use tracing::{debug, warn};

use crate::body::{BoxError, BufferedBody, Completion, CountingBody, RequestBody, ResponseBody, UpstreamBody};
use crate::headers::{
    X_CALL_ID, X_START_TIME, ensure_call_id, is_idempotent, start_time_value, strip_hop_headers,
    upstream_headers,
};
use crate::pool::{ConnectionPool, PoolError, PooledConnection};
use crate::resolver::{ResolvedEndpoint, Resolver, Selection};

/// One invocation as captured at the edge or synthesized by a worker.
#[derive(Debug)]
pub struct InvocationRequest<B> {
    pub identity: FunctionIdentity,
    pub method: Method,
    /// Path forwarded to the function, starting with `/`.
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: B,
    pub deadline: Instant,
    pub call_id: String,
    pub kind: InvocationPath,
}

impl<B> InvocationRequest<B> {
    /// Capture a request; the call ID is taken from `X-Call-Id` or generated.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: FunctionIdentity,
        method: Method,
        path: impl Into<String>,
        query: Option<String>,
        mut headers: HeaderMap,
        body: B,
        deadline: Instant,
        kind: InvocationPath,
    ) -> Self {
        let call_id = ensure_call_id(&mut headers);
        let mut path = path.into();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        Self {
            identity,
            method,
            path,
            query,
            headers,
            body,
            deadline,
            call_id,
            kind,
        }
    }

    fn path_and_query(&self) -> String {
        match self.query.as_deref() {
            Some(q) if !q.is_empty() => format!("{}?{}", self.path, q),
            _ => self.path.clone(),
        }
    }
}

pub type InvocationResponse = Response<ResponseBody>;

/// The invocation capability handed to queue workers.
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke(
        &self,
        request: InvocationRequest<BufferedBody>,
    ) -> Result<InvocationResponse, GatewayError>;
}

enum SendFailure {
    /// Nothing reached the replica; the body is intact.
    Unsent { body: UpstreamBody, error: String },
    /// The request may have been received.
    Sent { error: hyper::Error },
    Timeout,
    Rejected(GatewayError),
}

pub struct InvocationProxy {
    resolver: Arc<Resolver>,
    pool: ConnectionPool,
    health: HealthRegistry,
    observer: Arc<dyn Observer>,
}

impl InvocationProxy {
    pub fn new(
        resolver: Arc<Resolver>,
        pool: ConnectionPool,
        health: HealthRegistry,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            resolver,
            pool,
            health,
            observer,
        }
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Forward `request` to a replica of its function and stream the answer.
    ///
    /// Exactly one observation is emitted per call: here for failures, by
    /// the response body once it ends for successes.
    pub async fn invoke<B: RequestBody>(
        &self,
        request: InvocationRequest<B>,
    ) -> Result<InvocationResponse, GatewayError> {
        let started = Instant::now();
        self.observer.started(&request.identity);

        let observation = Observation {
            function: request.identity.name.clone(),
            namespace: request.identity.namespace.clone(),
            status: 0,
            duration_ns: 0,
            bytes_out: 0,
            bytes_in: 0,
            call_id: request.call_id.clone(),
            path: request.kind,
        };

        let result = if started >= request.deadline {
            Err(GatewayError::Timeout(format!(
                "no time left to invoke {}",
                request.identity
            )))
        } else {
            self.forward(request, started, observation.clone()).await
        };

        if let Err(e) = &result {
            let status = e.status_code().as_u16();
            debug!(
                function = %format_args!("{}.{}", observation.function, observation.namespace),
                call_id = %observation.call_id,
                status,
                error = %e,
                "invocation failed"
            );
            self.observer.observe(&Observation {
                status,
                duration_ns: started.elapsed().as_nanos() as u64,
                ..observation
            });
        }
        result
    }

    async fn forward<B: RequestBody>(
        &self,
        request: InvocationRequest<B>,
        started: Instant,
        observation: Observation,
    ) -> Result<InvocationResponse, GatewayError> {
        let deadline = request.deadline;
        let identity = request.identity.clone();
        let uri = request.path_and_query();
        let retryable = is_idempotent(&request.method, &request.headers);
        let start_time = start_time_value();

        let mut outbound = upstream_headers(&request.headers);
        if let Ok(value) = HeaderValue::from_str(&request.call_id) {
            outbound.insert(X_CALL_ID, value);
        }

        let mut selection = match request.kind {
            InvocationPath::Async => Selection::sticky(request.call_id.clone()),
            InvocationPath::Sync => Selection::default(),
        };

        let sent = Arc::new(AtomicU64::new(0));
        let mut replay = if retryable { request.body.replay() } else { None };
        let mut body = CountingBody::wrap(request.body.into_upstream(), sent.clone());
        let mut retried = false;

        loop {
            let endpoint = self.resolve(&identity, &selection, deadline).await?;
            let upstream = build_request(&request.method, &uri, &outbound, &endpoint, body)?;

            let failure = match self.exchange(&endpoint, upstream, deadline).await {
                Ok((response, conn)) => {
                    if endpoint.is_direct() {
                        self.health.record_success(&endpoint.address());
                    }

                    let status = response.status();
                    if status.is_server_error() && !retried {
                        if let Some(again) = replay.take() {
                            let next = selection.clone().excluding(endpoint.key.clone());
                            if let Some(other) = self.alternative(&identity, &next, &endpoint).await {
                                debug!(
                                    function = %identity,
                                    status = status.as_u16(),
                                    from = %endpoint.key,
                                    to = %other.key,
                                    "retrying idempotent request after upstream 5xx"
                                );
                                sent.store(0, Ordering::Relaxed);
                                body = CountingBody::wrap(again.into_upstream(), sent.clone());
                                selection = next;
                                retried = true;
                                continue;
                            }
                        }
                    }

                    return Ok(self.respond(
                        response,
                        conn,
                        deadline,
                        Completion {
                            observer: self.observer.clone(),
                            observation: Observation {
                                status: status.as_u16(),
                                ..observation
                            },
                            started,
                            sent,
                        },
                        start_time,
                    ));
                }
                Err(failure) => failure,
            };

            match failure {
                SendFailure::Timeout => {
                    return Err(GatewayError::Timeout(format!(
                        "{identity} did not answer before the deadline"
                    )));
                }
                SendFailure::Rejected(e) => return Err(e),
                SendFailure::Unsent { body: intact, error } => {
                    self.note_failure(&endpoint, false);
                    if retried {
                        return Err(GatewayError::UpstreamFailure(error));
                    }
                    let next = selection.clone().excluding(endpoint.key.clone());
                    // A lone direct replica has nowhere else to go; waiting
                    // for readiness would turn a dial error into a 503.
                    if endpoint.is_direct()
                        && self.alternative(&identity, &next, &endpoint).await.is_none()
                    {
                        return Err(GatewayError::UpstreamFailure(error));
                    }
                    warn!(function = %identity, upstream = %endpoint.key, %error, "upstream unreachable, retrying once");
                    body = intact;
                    selection = next;
                    retried = true;
                }
                SendFailure::Sent { error } => {
                    let violation = error.is_parse() || error.is_parse_status();
                    self.note_failure(&endpoint, violation);
                    let again = if retried { None } else { replay.take() };
                    let Some(again) = again else {
                        return Err(GatewayError::UpstreamFailure(error.to_string()));
                    };
                    warn!(function = %identity, upstream = %endpoint.key, %error, "idempotent request failed, retrying once");
                    sent.store(0, Ordering::Relaxed);
                    body = CountingBody::wrap(again.into_upstream(), sent.clone());
                    selection = selection.excluding(endpoint.key.clone());
                    retried = true;
                }
            }
        }
    }

    async fn resolve(
        &self,
        identity: &FunctionIdentity,
        selection: &Selection,
        deadline: Instant,
    ) -> Result<ResolvedEndpoint, GatewayError> {
        let wait = self.resolver.resolve_until_ready(identity, selection, deadline);
        match tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), wait).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(format!("resolving {identity}"))),
        }
    }

    /// Another routable replica, if there is one.
    async fn alternative(
        &self,
        identity: &FunctionIdentity,
        selection: &Selection,
        current: &ResolvedEndpoint,
    ) -> Option<ResolvedEndpoint> {
        if !current.is_direct() {
            return None;
        }
        self.resolver
            .resolve(identity, selection)
            .await
            .ok()
            .filter(|other| other.key != current.key)
    }

    /// Send one request over a pooled connection. A stale idle connection
    /// is replaced by a fresh one without consuming the retry.
    async fn exchange(
        &self,
        endpoint: &ResolvedEndpoint,
        request: Request<UpstreamBody>,
        deadline: Instant,
    ) -> Result<(Response<Incoming>, PooledConnection), SendFailure> {
        let until = tokio::time::Instant::from_std(deadline);
        let mut request = request;
        let mut conn = match self.pool.get(&endpoint.key, deadline).await {
            Ok(conn) => conn,
            Err(e) => return Err(pool_failure(e, request)),
        };

        loop {
            let stale_allowed = conn.is_reused();

            match tokio::time::timeout_at(until, conn.ready()).await {
                Err(_) => return Err(SendFailure::Timeout),
                Ok(Err(e)) => {
                    if stale_allowed {
                        debug!(upstream = %endpoint.key, "idle connection was stale, redialing");
                        drop(conn);
                        conn = match self.pool.connect(&endpoint.key, deadline).await {
                            Ok(conn) => conn,
                            Err(e) => return Err(pool_failure(e, request)),
                        };
                        continue;
                    }
                    return Err(SendFailure::Unsent {
                        body: request.into_body(),
                        error: e.to_string(),
                    });
                }
                Ok(Ok(())) => {}
            }

            match tokio::time::timeout_at(until, conn.send(request)).await {
                Err(_) => return Err(SendFailure::Timeout),
                Ok(Ok(response)) => return Ok((response, conn)),
                Ok(Err(mut e)) => match e.take_message() {
                    Some(unsent) if stale_allowed => {
                        debug!(upstream = %endpoint.key, "idle connection was stale, redialing");
                        request = unsent;
                        drop(conn);
                        conn = match self.pool.connect(&endpoint.key, deadline).await {
                            Ok(conn) => conn,
                            Err(e) => return Err(pool_failure(e, request)),
                        };
                    }
                    Some(unsent) => {
                        return Err(SendFailure::Unsent {
                            body: unsent.into_body(),
                            error: e.into_error().to_string(),
                        });
                    }
                    None => return Err(SendFailure::Sent { error: e.into_error() }),
                },
            }
        }
    }

    fn respond(
        &self,
        response: Response<Incoming>,
        conn: PooledConnection,
        deadline: Instant,
        completion: Completion,
        start_time: HeaderValue,
    ) -> InvocationResponse {
        let (mut parts, incoming) = response.into_parts();
        strip_hop_headers(&mut parts.headers);
        if let Ok(value) = HeaderValue::from_str(&completion.observation.call_id) {
            parts.headers.insert(X_CALL_ID, value);
        }
        parts.headers.insert(X_START_TIME, start_time);

        debug!(
            function = %format_args!(
                "{}.{}",
                completion.observation.function, completion.observation.namespace
            ),
            call_id = %completion.observation.call_id,
            status = parts.status.as_u16(),
            upstream = %conn.key(),
            "upstream answered"
        );

        let upstream = incoming.map_err(|e| -> BoxError { Box::new(e) }).boxed_unsync();
        let body = ResponseBody::upstream(upstream, Some(deadline), conn, Some(completion));
        Response::from_parts(parts, body)
    }

    fn note_failure(&self, endpoint: &ResolvedEndpoint, violation: bool) {
        if !endpoint.is_direct() {
            return;
        }
        let address = endpoint.address();
        if violation {
            self.health.record_protocol_violation(&address);
        } else {
            self.health.record_failure(&address);
        }
    }
}

#[async_trait]
impl Invoker for InvocationProxy {
    async fn invoke(
        &self,
        request: InvocationRequest<BufferedBody>,
    ) -> Result<InvocationResponse, GatewayError> {
        InvocationProxy::invoke(self, request).await
    }
}

fn pool_failure(error: PoolError, request: Request<UpstreamBody>) -> SendFailure {
    match error {
        PoolError::Timeout(_) => SendFailure::Timeout,
        PoolError::Exhausted(_) => SendFailure::Rejected(error.into()),
        PoolError::Connect { .. } => SendFailure::Unsent {
            body: request.into_body(),
            error: error.to_string(),
        },
    }
}

fn build_request(
    method: &Method,
    uri: &str,
    headers: &HeaderMap,
    endpoint: &ResolvedEndpoint,
    body: UpstreamBody,
) -> Result<Request<UpstreamBody>, GatewayError> {
    let mut request = Request::new(body);
    *request.method_mut() = method.clone();
    *request.uri_mut() = uri
        .parse()
        .map_err(|e| GatewayError::Invalid(format!("request path {uri:?}: {e}")))?;
    *request.headers_mut() = headers.clone();
    let host = HeaderValue::from_str(&endpoint.address())
        .map_err(|e| GatewayError::Internal(format!("upstream host header: {e}")))?;
    request.headers_mut().insert(header::HOST, host);
    Ok(request)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use axum::Router;
    use axum::body::Bytes;
    use axum::extract::{OriginalUri, State};
    use axum::http::StatusCode;
    use axum::routing::{any, get};
    use fngate_core::{
        DEFAULT_NAMESPACE, FunctionStatus, GatewayConfig, MemoryProvider, ReplicaEndpoint,
    };
    use fngate_health::HealthPolicy;

    use super::*;
    use crate::body::StreamingBody;
    use crate::pool::PoolLimits;
    use crate::resolver::ResolverConfig;

    #[derive(Default)]
    struct Recording(Mutex<Vec<Observation>>);

    impl Observer for Recording {
        fn observe(&self, observation: &Observation) {
            self.0.lock().unwrap().push(observation.clone());
        }
    }

    async fn serve(router: Router) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        port
    }

    fn closed_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn echo_upstream() -> u16 {
        serve(Router::new().fallback(any(
            |OriginalUri(uri): OriginalUri, headers: HeaderMap, body: Bytes| async move {
                let call_id = headers
                    .get("x-call-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                (
                    [("x-seen-uri", uri.to_string()), ("x-seen-call-id", call_id)],
                    body,
                )
            },
        )))
        .await
    }

    struct Harness {
        proxy: InvocationProxy,
        health: HealthRegistry,
        observed: Arc<Recording>,
    }

    fn harness(ports: &[u16]) -> Harness {
        let config = GatewayConfig::default();
        harness_with(ports, PoolLimits::from(&config.pool), Duration::ZERO)
    }

    fn harness_with(ports: &[u16], limits: PoolLimits, not_ready_grace: Duration) -> Harness {
        let provider = Arc::new(MemoryProvider::new(DEFAULT_NAMESPACE));
        let endpoints: Vec<_> = ports
            .iter()
            .map(|p| ReplicaEndpoint::new("127.0.0.1", *p))
            .collect();
        provider
            .insert(FunctionStatus {
                name: "echo".into(),
                replicas: endpoints.len() as u32,
                available_replicas: endpoints.len() as u32,
                endpoints,
                ..Default::default()
            })
            .unwrap();

        let config = GatewayConfig::default();
        let health = HealthRegistry::new(HealthPolicy::from(&config.health));
        let resolver = Arc::new(Resolver::new(
            provider,
            health.clone(),
            ResolverConfig {
                direct: true,
                not_ready_grace,
                ..ResolverConfig::from(&config)
            },
        ));
        let observed = Arc::new(Recording::default());
        let proxy = InvocationProxy::new(
            resolver,
            ConnectionPool::new(limits),
            health.clone(),
            observed.clone(),
        );
        Harness {
            proxy,
            health,
            observed,
        }
    }

    fn echo() -> FunctionIdentity {
        FunctionIdentity::parse("echo", DEFAULT_NAMESPACE).unwrap()
    }

    fn request<B>(method: Method, path: &str, body: B, timeout: Duration) -> InvocationRequest<B> {
        InvocationRequest::new(
            echo(),
            method,
            path,
            None,
            HeaderMap::new(),
            body,
            Instant::now() + timeout,
            InvocationPath::Sync,
        )
    }

    async fn body_of(response: InvocationResponse) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn streams_body_and_sets_call_id() {
        let port = echo_upstream().await;
        let h = harness(&[port]);

        let mut req = request(
            Method::POST,
            "/greet",
            StreamingBody::new(http_body_util::Full::new(Bytes::from_static(b"hi"))),
            Duration::from_secs(5),
        );
        req.query = Some("lang=en".into());
        let call_id = req.call_id.clone();

        let response = h.proxy.invoke(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[X_CALL_ID], call_id.as_str());
        assert_eq!(response.headers()["x-seen-call-id"], call_id.as_str());
        assert_eq!(response.headers()["x-seen-uri"], "/greet?lang=en");
        assert!(response.headers().contains_key(X_START_TIME));
        assert_eq!(body_of(response).await, "hi");

        let observed = h.observed.0.lock().unwrap();
        assert_eq!(observed.len(), 1);
        assert_eq!(observed[0].status, 200);
        assert_eq!(observed[0].bytes_out, 2);
        assert_eq!(observed[0].bytes_in, 2);
    }

    #[tokio::test]
    async fn sequential_calls_reuse_the_connection() {
        let port = echo_upstream().await;
        let h = harness(&[port]);

        for _ in 0..3 {
            let response = h
                .proxy
                .invoke(request(Method::GET, "/", StreamingBody::empty(), Duration::from_secs(5)))
                .await
                .unwrap();
            body_of(response).await;
        }
        let stats = h.proxy.pool().stats();
        assert_eq!(stats.dialed, 1);
        assert_eq!(stats.reused, 2);
    }

    #[tokio::test]
    async fn deadline_before_headers_is_a_timeout() {
        let port = serve(Router::new().route(
            "/",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        ))
        .await;
        let h = harness(&[port]);

        let started = Instant::now();
        let err = h
            .proxy
            .invoke(request(Method::GET, "/", StreamingBody::empty(), Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(h.observed.0.lock().unwrap()[0].status, 504);
    }

    #[tokio::test]
    async fn zero_deadline_fails_immediately() {
        let h = harness(&[echo_upstream().await]);
        let mut req = request(Method::GET, "/", StreamingBody::empty(), Duration::ZERO);
        req.deadline = Instant::now();
        let err = h.proxy.invoke(req).await.unwrap_err();
        assert!(matches!(err, GatewayError::Timeout(_)));
    }

    #[tokio::test]
    async fn unreachable_replica_is_retried_on_another() {
        let dead = closed_port();
        let live = echo_upstream().await;
        let h = harness(&[dead, live]);

        // A streamed POST is not replayable, but nothing reached the dead replica.
        let response = h
            .proxy
            .invoke(request(
                Method::POST,
                "/",
                StreamingBody::new(http_body_util::Full::new(Bytes::from_static(b"once"))),
                Duration::from_secs(5),
            ))
            .await
            .unwrap();
        assert_eq!(body_of(response).await, "once");

        let dead_address = format!("127.0.0.1:{dead}");
        assert!(
            h.health
                .snapshot()
                .iter()
                .any(|(address, _)| *address == dead_address)
        );
    }

    #[tokio::test]
    async fn all_replicas_unreachable_is_bad_gateway() {
        let h = harness(&[closed_port(), closed_port()]);
        let err = h
            .proxy
            .invoke(request(Method::GET, "/", StreamingBody::empty(), Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamFailure(_)));
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn lone_unreachable_replica_is_bad_gateway_without_waiting() {
        let config = GatewayConfig::default();
        let h = harness_with(
            &[closed_port()],
            PoolLimits::from(&config.pool),
            Duration::from_secs(2),
        );

        let started = Instant::now();
        let err = h
            .proxy
            .invoke(request(Method::GET, "/", StreamingBody::empty(), Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamFailure(_)), "{err:?}");
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(h.observed.0.lock().unwrap()[0].status, 502);
    }

    /// Answers one request per connection, then hangs up without saying so.
    async fn hang_up_upstream() -> u16 {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket
                        .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
                        .await;
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn hung_up_connections_do_not_exhaust_a_per_host_cap_of_one() {
        let config = GatewayConfig::default();
        let h = harness_with(
            &[hang_up_upstream().await],
            PoolLimits {
                max_active_per_host: 1,
                ..PoolLimits::from(&config.pool)
            },
            Duration::ZERO,
        );

        for _ in 0..3 {
            let response = h
                .proxy
                .invoke(request(Method::GET, "/", StreamingBody::empty(), Duration::from_secs(5)))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(body_of(response).await, "ok");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(h.proxy.pool().stats().active, 0);
    }

    async fn failing_then_healthy() -> (u16, u16) {
        let failing = serve(Router::new().fallback(any(|| async {
            (StatusCode::INTERNAL_SERVER_ERROR, "boom")
        })))
        .await;
        (failing, echo_upstream().await)
    }

    #[tokio::test]
    async fn server_error_is_passed_through_for_non_idempotent_calls() {
        let (failing, healthy) = failing_then_healthy().await;
        let h = harness(&[failing, healthy]);

        let response = h
            .proxy
            .invoke(request(
                Method::POST,
                "/",
                BufferedBody::new("x"),
                Duration::from_secs(5),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_of(response).await, "boom");
    }

    #[tokio::test]
    async fn idempotent_call_is_retried_after_server_error() {
        let (failing, healthy) = failing_then_healthy().await;
        let h = harness(&[failing, healthy]);

        let response = h
            .proxy
            .invoke(request(Method::PUT, "/", BufferedBody::new("x"), Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_of(response).await, "x");
    }

    #[tokio::test]
    async fn unknown_function_is_observed() {
        let h = harness(&[]);
        let mut req = request(Method::GET, "/", StreamingBody::empty(), Duration::from_secs(1));
        req.identity = FunctionIdentity::parse("missing", DEFAULT_NAMESPACE).unwrap();

        let err = h.proxy.invoke(req).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
        let observed = h.observed.0.lock().unwrap();
        assert_eq!(observed[0].status, 404);
        assert_eq!(observed[0].function, "missing");
    }

    #[tokio::test]
    async fn hop_headers_are_not_forwarded() {
        let port = serve(Router::new().fallback(any(|headers: HeaderMap| async move {
            let leaked = headers.contains_key("x-private") || headers.contains_key("keep-alive");
            let host = headers
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            format!("{leaked} {host}")
        })))
        .await;
        let h = harness(&[port]);

        let mut req = request(Method::GET, "/", StreamingBody::empty(), Duration::from_secs(5));
        req.headers.insert(header::CONNECTION, "x-private".parse().unwrap());
        req.headers.insert("x-private", "secret".parse().unwrap());
        req.headers.insert("keep-alive", "timeout=5".parse().unwrap());
        req.headers.insert(header::HOST, "gateway:8080".parse().unwrap());

        let body = body_of(h.proxy.invoke(req).await.unwrap()).await;
        assert_eq!(body, format!("false 127.0.0.1:{port}"));
    }

    #[tokio::test]
    async fn successful_call_reaches_upstream_once() {
        let hits = Arc::new(AtomicU64::new(0));
        let port = serve(
            Router::new()
                .fallback(any(|State(hits): State<Arc<AtomicU64>>| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    "counted"
                }))
                .with_state(hits.clone()),
        )
        .await;
        let h = harness(&[port]);
        let response = h
            .proxy
            .invoke(request(Method::GET, "/", StreamingBody::empty(), Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(body_of(response).await, "counted");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
