//! Invocation handlers: `/function/*` and `/async-function/*`.
//!
//! The sync path never buffers: the client body is streamed upstream and
//! the upstream body streamed back. The async path materializes the body,
//! bounded by `max_body_bytes`, and answers 202 once the broker has it.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, Request, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use fngate_admission::AdmissionToken;
use fngate_core::{FunctionIdentity, GatewayError, InvocationPath};
use fngate_proxy::headers::{X_CALL_ID, X_CALLBACK_URL, add_forwarded, ensure_call_id};
use fngate_proxy::{BoxError, BufferedBody, InvocationRequest, ResponseBody, StreamingBody};
use fngate_queue::AsyncInvocation;
use hyper::body::{Body as HttpBody, Frame, SizeHint};
use tracing::debug;

use crate::error::ApiError;
use crate::gateway::Gateway;

// ── Sync ───────────────────────────────────────────────────────

/// ANY /function/{name}
pub async fn invoke(
    State(gateway): State<Arc<Gateway>>,
    Path(name): Path<String>,
    request: Request,
) -> Result<Response, ApiError> {
    forward(&gateway, &name, "/", request).await
}

/// ANY /function/{name}/{*path}
pub async fn invoke_path(
    State(gateway): State<Arc<Gateway>>,
    Path((name, path)): Path<(String, String)>,
    request: Request,
) -> Result<Response, ApiError> {
    forward(&gateway, &name, &path, request).await
}

async fn forward(
    gateway: &Gateway,
    name: &str,
    path: &str,
    request: Request,
) -> Result<Response, ApiError> {
    let (mut parts, body) = request.into_parts();
    let call_id = ensure_call_id(&mut parts.headers);
    let fail = |e: GatewayError| ApiError::new(e, call_id.clone());

    let identity = FunctionIdentity::parse(name, &gateway.config.default_namespace).map_err(fail)?;
    let token = gateway
        .admission
        .admit(&identity, InvocationPath::Sync)
        .into_result()
        .map_err(fail)?;

    let deadline = Instant::now() + gateway.config.upstream_timeout;
    if let Some(zero) = &gateway.zero {
        zero.ensure_ready(&identity, deadline).await.map_err(fail)?;
    }

    let client = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    add_forwarded(&mut parts.headers, client);

    let request = InvocationRequest::new(
        identity,
        parts.method,
        path,
        parts.uri.query().map(str::to_string),
        parts.headers,
        StreamingBody::new(body),
        deadline,
        InvocationPath::Sync,
    );
    let response = gateway.proxy.invoke(request).await.map_err(fail)?;

    let (parts, body) = response.into_parts();
    Ok(Response::from_parts(parts, Body::new(GuardedBody::new(body, token))))
}

/// A response body that keeps its request admitted until the last byte is
/// sent or the client goes away.
pub struct GuardedBody {
    inner: Pin<Box<ResponseBody>>,
    _token: AdmissionToken,
}

impl GuardedBody {
    pub fn new(inner: ResponseBody, token: AdmissionToken) -> Self {
        Self {
            inner: Box::pin(inner),
            _token: token,
        }
    }
}

impl HttpBody for GuardedBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        self.inner.as_mut().poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

// ── Async ──────────────────────────────────────────────────────

/// POST /async-function/{name}
pub async fn enqueue(
    State(gateway): State<Arc<Gateway>>,
    Path(name): Path<String>,
    request: Request,
) -> Result<Response, ApiError> {
    accept(&gateway, &name, "/", request).await
}

/// POST /async-function/{name}/{*path}
pub async fn enqueue_path(
    State(gateway): State<Arc<Gateway>>,
    Path((name, path)): Path<(String, String)>,
    request: Request,
) -> Result<Response, ApiError> {
    accept(&gateway, &name, &format!("/{path}"), request).await
}

async fn accept(
    gateway: &Gateway,
    name: &str,
    path: &str,
    request: Request,
) -> Result<Response, ApiError> {
    let (mut parts, body) = request.into_parts();
    let call_id = ensure_call_id(&mut parts.headers);
    let fail = |e: GatewayError| ApiError::new(e, call_id.clone());

    let identity = FunctionIdentity::parse(name, &gateway.config.default_namespace).map_err(fail)?;
    let _token = gateway
        .admission
        .admit(&identity, InvocationPath::Async)
        .into_result()
        .map_err(fail)?;

    let callback_url = match parts.headers.get(&X_CALLBACK_URL) {
        Some(value) => Some(callback_url(value.as_bytes()).map_err(fail)?),
        None => None,
    };

    let deadline = Instant::now() + gateway.config.upstream_timeout;
    if let Some(zero) = &gateway.zero {
        zero.ensure_ready(&identity, deadline).await.map_err(fail)?;
    }
    let status = gateway.resolver.status(&identity).await.map_err(fail)?;

    let read = BufferedBody::read_bounded(body, gateway.publisher.max_body_bytes());
    let body = tokio::time::timeout(gateway.config.read_timeout, read)
        .await
        .map_err(|_| fail(GatewayError::Timeout("reading request body".into())))?
        .map_err(fail)?;

    let client = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    add_forwarded(&mut parts.headers, client);
    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let message_id = gateway
        .publisher
        .enqueue(AsyncInvocation {
            identity: identity.clone(),
            method: parts.method,
            path: path.to_string(),
            query: parts.uri.query().map(str::to_string),
            headers: parts.headers,
            host,
            body: body.bytes().clone(),
            call_id: call_id.clone(),
            callback_url,
            annotations: status.annotations.clone(),
        })
        .await
        .map_err(fail)?;

    debug!(function = %identity, %message_id, %call_id, "async invocation accepted");
    Ok((StatusCode::ACCEPTED, [(X_CALL_ID, call_id)]).into_response())
}

fn callback_url(raw: &[u8]) -> Result<String, GatewayError> {
    let url = std::str::from_utf8(raw)
        .map_err(|_| GatewayError::Invalid("X-Callback-Url is not valid text".into()))?
        .trim();
    let uri: axum::http::Uri = url
        .parse()
        .map_err(|_| GatewayError::Invalid(format!("X-Callback-Url {url:?} is not a URL")))?;
    if uri.scheme().is_none() || uri.host().is_none() {
        return Err(GatewayError::Invalid(format!(
            "X-Callback-Url {url:?} must be absolute"
        )));
    }
    Ok(url.to_string())
}
