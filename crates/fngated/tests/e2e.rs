//! End-to-end scenarios: real upstreams on loopback, the full router, and a
//! queue worker draining into a real callback sink.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::routing::{any, post};
use fngate_api::{Gateway, build_router};
use fngate_autoscale::policy::{MAX_SCALE_LABEL, MIN_SCALE_LABEL, SCALE_STEP_LABEL};
use fngate_core::{
    DEFAULT_NAMESPACE, FunctionIdentity, FunctionStatus, GatewayConfig, MemoryProvider,
    ReplicaEndpoint,
};
use fngate_queue::RedbBroker;
use fngate_worker::{HttpCallbackSender, QueueWorker, WorkerConfig};
use http_body_util::BodyExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

// ── Harness ────────────────────────────────────────────────────

async fn serve(router: Router) -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    port
}

fn function(name: &str, ports: &[u16]) -> FunctionStatus {
    FunctionStatus {
        name: name.into(),
        replicas: ports.len() as u32,
        available_replicas: ports.len() as u32,
        endpoints: ports
            .iter()
            .map(|&p| ReplicaEndpoint::new("127.0.0.1", p))
            .collect(),
        ..Default::default()
    }
}

struct Stack {
    gateway: Arc<Gateway>,
    provider: Arc<MemoryProvider>,
}

impl Stack {
    fn new(functions: Vec<FunctionStatus>, adjust: impl FnOnce(&mut GatewayConfig)) -> Self {
        let provider = Arc::new(MemoryProvider::new(DEFAULT_NAMESPACE));
        for f in functions {
            provider.insert(f).unwrap();
        }
        let mut config = GatewayConfig::default();
        config.resolver.direct_functions = true;
        config.upstream_timeout = Duration::from_secs(5);
        adjust(&mut config);

        let broker = Arc::new(RedbBroker::open_in_memory(Duration::from_secs(30)).unwrap());
        let gateway = Arc::new(Gateway::build(config, provider.clone(), broker));
        Self { gateway, provider }
    }

    fn router(&self) -> Router {
        build_router(self.gateway.clone())
    }

    fn start_worker(&self) -> CancellationToken {
        let config = WorkerConfig::from_gateway(
            &self.gateway.config,
            self.gateway.publisher.default_queue(),
        );
        let worker = Arc::new(QueueWorker::new(
            self.gateway.broker.clone(),
            self.gateway.invoker(),
            Arc::new(HttpCallbackSender::new(self.gateway.client.clone())),
            config,
        ));
        let cancel = CancellationToken::new();
        tokio::spawn(worker.run(cancel.clone()));
        cancel
    }
}

async fn text(response: axum::response::Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn post_to(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::from(body.to_string()))
        .unwrap()
}

// ── Scenarios ──────────────────────────────────────────────────

#[tokio::test]
async fn sync_invocation_spreads_over_replicas() {
    let a = serve(Router::new().fallback(any(|| async { "replica-a" }))).await;
    let b = serve(Router::new().fallback(any(|| async { "replica-b" }))).await;
    let stack = Stack::new(vec![function("hello", &[a, b])], |_| {});

    let mut seen = HashSet::new();
    for _ in 0..4 {
        let response = stack
            .router()
            .oneshot(post_to("/function/hello", "hi"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-call-id"));
        seen.insert(text(response).await);
    }
    assert_eq!(
        seen,
        HashSet::from(["replica-a".to_string(), "replica-b".to_string()])
    );
}

#[tokio::test]
async fn async_invocation_reaches_the_callback() {
    let upstream = serve(Router::new().fallback(any(|body: Bytes| async move {
        format!("processed {}", String::from_utf8_lossy(&body))
    })))
    .await;

    let (tx, mut rx) = mpsc::unbounded_channel::<(HeaderMap, Bytes)>();
    let sink = serve(Router::new().route(
        "/done",
        post(move |headers: HeaderMap, body: Bytes| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((headers, body));
                StatusCode::OK
            }
        }),
    ))
    .await;

    let stack = Stack::new(vec![function("job", &[upstream])], |c| {
        c.worker.poll_wait = Duration::from_millis(50);
    });
    let cancel = stack.start_worker();

    let mut request = post_to("/async-function/job", "payload");
    request.headers_mut().insert(
        "x-callback-url",
        format!("http://127.0.0.1:{sink}/done").parse().unwrap(),
    );
    let response = stack.router().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let call_id = response.headers()["x-call-id"].to_str().unwrap().to_string();

    let (headers, body) = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("callback in time")
        .expect("callback delivered");
    assert_eq!(headers["x-function-status"], "200");
    assert_eq!(headers["x-call-id"], call_id.as_str());
    assert_eq!(&body[..], b"processed payload");

    cancel.cancel();
}

#[tokio::test]
async fn slow_upstream_times_out() {
    let slow = serve(Router::new().fallback(any(|| async {
        tokio::time::sleep(Duration::from_secs(3)).await;
        "late"
    })))
    .await;
    let stack = Stack::new(vec![function("slow", &[slow])], |c| {
        c.upstream_timeout = Duration::from_secs(1);
    });

    let started = std::time::Instant::now();
    let response = stack
        .router()
        .oneshot(post_to("/function/slow", ""))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn saturated_gateway_sheds_load() {
    let slow = serve(Router::new().fallback(any(|| async {
        tokio::time::sleep(Duration::from_millis(500)).await;
        "done"
    })))
    .await;
    let stack = Stack::new(vec![function("slow", &[slow])], |c| {
        c.admission.max_inflight = 1;
    });

    let first = tokio::spawn(stack.router().oneshot(post_to("/function/slow", "")));
    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = stack
        .router()
        .oneshot(post_to("/function/slow", ""))
        .await
        .unwrap();

    assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(second.headers().contains_key("retry-after"));

    let first = first.await.unwrap().unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(text(first).await, "done");
}

#[tokio::test]
async fn alert_scales_once_then_cools_down() {
    let mut status = function("busy", &[]);
    status.replicas = 1;
    status.available_replicas = 1;
    status.labels = [
        (MIN_SCALE_LABEL, "1"),
        (MAX_SCALE_LABEL, "10"),
        (SCALE_STEP_LABEL, "2"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    let stack = Stack::new(vec![status], |_| {});

    let alert = serde_json::json!({
        "receiver": "scale-up",
        "status": "firing",
        "alerts": [{
            "status": "firing",
            "labels": { "alertname": "APIHighInvocationRate", "function_name": "busy" }
        }]
    })
    .to_string();
    let request = || {
        Request::builder()
            .method("POST")
            .uri("/system/alert")
            .header("content-type", "application/json")
            .body(Body::from(alert.clone()))
            .unwrap()
    };

    let response = stack.router().oneshot(request()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = serde_json::from_str(&text(response).await).unwrap();
    assert_eq!(body[0]["outcome"], "scaled");

    let response = stack.router().oneshot(request()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = serde_json::from_str(&text(response).await).unwrap();
    assert_eq!(body[0]["outcome"], "coolingDown");

    let busy = FunctionIdentity::parse("busy", DEFAULT_NAMESPACE).unwrap();
    assert_eq!(stack.provider.scale_calls(), vec![(busy, 3)]);
}

#[tokio::test]
async fn failing_async_invocation_is_dead_lettered() {
    let hits = Arc::new(AtomicU32::new(0));
    let counter = hits.clone();
    let broken = serve(Router::new().fallback(any(move || {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            (StatusCode::INTERNAL_SERVER_ERROR, "boom")
        }
    })))
    .await;

    let stack = Stack::new(vec![function("broken", &[broken])], |c| {
        c.queue.max_attempts = 3;
        c.worker.retry_base = Duration::from_millis(10);
        c.worker.retry_max = Duration::from_millis(50);
        c.worker.poll_wait = Duration::from_millis(50);
    });
    let cancel = stack.start_worker();

    let response = stack
        .router()
        .oneshot(post_to("/async-function/broken", "x"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let call_id = response.headers()["x-call-id"].to_str().unwrap().to_string();

    let dead = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let dead = stack.gateway.broker.dead_letters(10).await.unwrap();
            if !dead.is_empty() {
                return dead;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("dead letter in time");

    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].message.call_id, call_id);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    assert_eq!(stack.gateway.broker.depth().await.unwrap(), 0);

    cancel.cancel();
}
