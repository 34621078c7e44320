//! External auth delegate for `/system/*`.
//!
//! When `auth_proxy_url` is set, every system request is first replayed as
//! a `GET` carrying the caller's headers. Only a 200 lets the request
//! through; any other answer is relayed to the caller as is.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use fngate_core::GatewayError;
use fngate_proxy::headers::upstream_headers;
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::gateway::Gateway;

pub async fn require_auth(
    State(gateway): State<Arc<Gateway>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(url) = gateway.config.auth_proxy_url.as_deref() else {
        return next.run(request).await;
    };

    match gateway.client.get(url, delegate_headers(request.headers())).await {
        Ok(answer) if answer.status == StatusCode::OK => next.run(request).await,
        Ok(answer) => {
            debug!(path = %request.uri().path(), status = answer.status.as_u16(), "auth delegate refused");
            let mut response = (answer.status, answer.body).into_response();
            if let Some(content_type) = answer.headers.get(header::CONTENT_TYPE) {
                response
                    .headers_mut()
                    .insert(header::CONTENT_TYPE, content_type.clone());
            }
            response
        }
        Err(e) => {
            warn!(error = %e, "auth delegate unreachable");
            ApiError::from(GatewayError::Internal(format!("auth delegate: {e}"))).into_response()
        }
    }
}

fn delegate_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = upstream_headers(inbound);
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(header::CONTENT_TYPE);
    headers
}

#[cfg(test)]
mod tests {
    use axum::Router;
    use axum::routing::get as route_get;
    use tower::ServiceExt;

    use super::*;
    use crate::testing::{TestGateway, closed_port, get, serve};

    async fn delegate() -> String {
        let port = serve(Router::new().route(
            "/validate",
            route_get(|headers: HeaderMap| async move {
                match headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
                    Some("Bearer letmein") => (StatusCode::OK, "ok"),
                    _ => (StatusCode::UNAUTHORIZED, "who are you"),
                }
            }),
        ))
        .await;
        format!("http://127.0.0.1:{port}/validate")
    }

    #[tokio::test]
    async fn delegate_decides_system_access() {
        let url = delegate().await;
        let t = TestGateway::with_config(move |c| c.auth_proxy_url = Some(url)).await;

        let response = t.router().oneshot(get("/system/info")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let mut request = get("/system/info");
        request
            .headers_mut()
            .insert(header::AUTHORIZATION, "Bearer letmein".parse().unwrap());
        let response = t.router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn invocation_routes_skip_the_delegate() {
        let url = delegate().await;
        let t = TestGateway::with_config(move |c| c.auth_proxy_url = Some(url)).await;

        let response = t.router().oneshot(get("/healthz")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = t.router().oneshot(get("/function/echo")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unreachable_delegate_is_internal_error() {
        let url = format!("http://127.0.0.1:{}/validate", closed_port());
        let t = TestGateway::with_config(move |c| c.auth_proxy_url = Some(url)).await;

        let response = t.router().oneshot(get("/system/info")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
