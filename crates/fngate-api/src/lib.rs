//! fngate-api — the gateway's HTTP surface.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | ANY | `/function/{name}[/{*path}]` | Synchronous invocation, streamed |
//! | POST | `/async-function/{name}[/{*path}]` | Enqueue; 202 + `X-Call-Id` |
//! | POST | `/system/alert` | Alertmanager scaling webhook |
//! | GET | `/system/functions` | List functions (`?namespace=`) |
//! | POST/PUT/DELETE | `/system/functions` | Deploy, update, delete |
//! | GET | `/system/function/{name}` | Function status |
//! | POST | `/system/scale-function/{name}` | Scale to N replicas |
//! | GET | `/system/info` | Orchestrator and gateway version |
//! | POST | `/system/async-report` | Out-of-process worker completion |
//! | GET | `/healthz` | Liveness; 503 while starting or draining |
//! | GET | `/metrics` | Prometheus exposition |
//!
//! `/system/*` goes through the auth delegate when one is configured.
//! Errors are rendered as `{code, message, correlationId}`.

pub mod auth;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod system;

use std::sync::Arc;

use axum::Router;
use axum::middleware;
use axum::routing::{any, get, post};

pub use error::ApiError;
pub use gateway::{Gateway, GatewayInvoker, control_client};

/// Build the complete router over a shared gateway.
pub fn build_router(gateway: Arc<Gateway>) -> Router {
    let system = Router::new()
        .route("/alert", post(system::alert))
        .route(
            "/functions",
            get(system::list_functions)
                .post(system::deploy_function)
                .put(system::update_function)
                .delete(system::delete_function),
        )
        .route("/function/{name}", get(system::function_status))
        .route("/scale-function/{name}", post(system::scale_function))
        .route("/info", get(system::info))
        .route("/async-report", post(system::async_report))
        .route_layer(middleware::from_fn_with_state(
            gateway.clone(),
            auth::require_auth,
        ));

    Router::new()
        .route("/function/{name}", any(handlers::invoke))
        .route("/function/{name}/{*path}", any(handlers::invoke_path))
        .route("/async-function/{name}", post(handlers::enqueue))
        .route("/async-function/{name}/{*path}", post(handlers::enqueue_path))
        .nest("/system", system)
        .route("/healthz", get(system::healthz))
        .route("/metrics", get(system::prometheus_metrics))
        .with_state(gateway)
}
