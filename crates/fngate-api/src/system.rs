//! `/system/*` handlers, health and metrics.
//!
//! Function management is passed through to the orchestrator driver;
//! scaling goes through the alert scaler so direct requests and alerts share
//! one path to the orchestrator.

use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use fngate_autoscale::{AlertBatch, ScalingOutcome};
use fngate_core::{
    DeleteFunctionRequest, FunctionDeployment, FunctionIdentity, GatewayError, ProviderInfo,
    ScaleServiceRequest,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ApiError;
use crate::gateway::Gateway;

#[derive(Debug, Default, Deserialize)]
pub struct NamespaceQuery {
    pub namespace: Option<String>,
}

fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body)
        .map_err(|e| GatewayError::Invalid(format!("request body: {e}")).into())
}

fn identity(gateway: &Gateway, name: &str, namespace: Option<&str>) -> Result<FunctionIdentity, ApiError> {
    let default = &gateway.config.default_namespace;
    let identity = match namespace.filter(|ns| !ns.is_empty()) {
        Some(ns) => FunctionIdentity::new(name, Some(ns), default),
        None => FunctionIdentity::parse(name, default),
    };
    Ok(identity?)
}

// ── Scaling ────────────────────────────────────────────────────

/// POST /system/alert
///
/// 200 when every function was handled, 207 when any scale call failed.
pub async fn alert(
    State(gateway): State<Arc<Gateway>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let batch: AlertBatch = parse_json(&body)?;
    debug!(
        status = %batch.status,
        receiver = %batch.receiver,
        alerts = batch.alerts.len(),
        "alert batch received"
    );
    let outcomes = gateway.scaler.on_alert(batch).await;
    for outcome in &outcomes {
        if let ScalingOutcome::Scaled(decision) = outcome {
            gateway.resolver.invalidate(&decision.function);
        }
    }
    let status = if outcomes.iter().any(ScalingOutcome::is_failure) {
        StatusCode::MULTI_STATUS
    } else {
        StatusCode::OK
    };
    Ok((status, Json(outcomes)).into_response())
}

/// POST /system/scale-function/{name}
pub async fn scale_function(
    State(gateway): State<Arc<Gateway>>,
    Path(name): Path<String>,
    Query(query): Query<NamespaceQuery>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: ScaleServiceRequest = parse_json(&body)?;
    let namespace = Some(request.namespace.as_str())
        .filter(|ns| !ns.is_empty())
        .or(query.namespace.as_deref());
    let identity = identity(&gateway, &name, namespace)?;

    // Unknown functions are a 404, not a failed scale.
    gateway
        .provider
        .lookup(&identity)
        .await
        .map_err(GatewayError::from)?;

    let outcome = gateway.scaler.scale_to(&identity, request.replicas).await;
    if let ScalingOutcome::Failed { error, .. } = &outcome {
        return Err(GatewayError::UpstreamFailure(error.clone()).into());
    }
    gateway.resolver.invalidate(&identity);
    Ok((StatusCode::ACCEPTED, Json(outcome)).into_response())
}

// ── Functions ──────────────────────────────────────────────────

/// GET /system/functions
pub async fn list_functions(
    State(gateway): State<Arc<Gateway>>,
    Query(query): Query<NamespaceQuery>,
) -> Result<Response, ApiError> {
    let namespace = query
        .namespace
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| gateway.config.default_namespace.clone());
    let functions = gateway
        .provider
        .list(&namespace)
        .await
        .map_err(GatewayError::from)?;
    Ok(Json(functions).into_response())
}

/// GET /system/function/{name}
pub async fn function_status(
    State(gateway): State<Arc<Gateway>>,
    Path(name): Path<String>,
    Query(query): Query<NamespaceQuery>,
) -> Result<Response, ApiError> {
    let identity = identity(&gateway, &name, query.namespace.as_deref())?;
    let status = gateway
        .provider
        .lookup(&identity)
        .await
        .map_err(GatewayError::from)?;
    Ok(Json(status).into_response())
}

/// POST /system/functions
pub async fn deploy_function(
    State(gateway): State<Arc<Gateway>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let deployment: FunctionDeployment = parse_json(&body)?;
    let identity = identity(&gateway, &deployment.service, Some(&deployment.namespace))?;
    gateway
        .provider
        .deploy(deployment)
        .await
        .map_err(GatewayError::from)?;
    gateway.resolver.invalidate(&identity);
    info!(function = %identity, "function deployed");
    Ok(StatusCode::ACCEPTED.into_response())
}

/// PUT /system/functions
pub async fn update_function(
    State(gateway): State<Arc<Gateway>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let deployment: FunctionDeployment = parse_json(&body)?;
    let identity = identity(&gateway, &deployment.service, Some(&deployment.namespace))?;
    gateway
        .provider
        .update(deployment)
        .await
        .map_err(GatewayError::from)?;
    gateway.resolver.invalidate(&identity);
    info!(function = %identity, "function updated");
    Ok(StatusCode::ACCEPTED.into_response())
}

/// DELETE /system/functions
pub async fn delete_function(
    State(gateway): State<Arc<Gateway>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: DeleteFunctionRequest = parse_json(&body)?;
    let identity = identity(&gateway, &request.function_name, Some(&request.namespace))?;
    gateway
        .provider
        .delete(&identity)
        .await
        .map_err(GatewayError::from)?;
    gateway.resolver.invalidate(&identity);
    info!(function = %identity, "function deleted");
    Ok(StatusCode::ACCEPTED.into_response())
}

// ── Info & reports ─────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayInfo {
    pub provider: ProviderInfo,
    pub version: GatewayVersion,
    pub arch: &'static str,
}

#[derive(Debug, Serialize)]
pub struct GatewayVersion {
    pub release: &'static str,
}

/// GET /system/info
pub async fn info(State(gateway): State<Arc<Gateway>>) -> Result<Response, ApiError> {
    let provider = gateway.provider.info().await.map_err(GatewayError::from)?;
    Ok(Json(GatewayInfo {
        provider,
        version: GatewayVersion {
            release: env!("CARGO_PKG_VERSION"),
        },
        arch: std::env::consts::ARCH,
    })
    .into_response())
}

/// Completion report from a worker running outside the gateway.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AsyncReport {
    pub name: String,
    pub status_code: u16,
    /// Seconds.
    pub time_taken: f64,
}

/// POST /system/async-report
pub async fn async_report(
    State(gateway): State<Arc<Gateway>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let report: AsyncReport = parse_json(&body)?;
    let identity = identity(&gateway, &report.name, None)?;
    let taken = Duration::try_from_secs_f64(report.time_taken.max(0.0)).unwrap_or_default();
    gateway
        .metrics
        .record(&identity.to_string(), report.status_code, taken);
    Ok(StatusCode::ACCEPTED.into_response())
}

// ── Health & metrics ───────────────────────────────────────────

/// GET /healthz
pub async fn healthz(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    if gateway.liveness.is_ready() {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "draining")
    }
}

/// GET /metrics
pub async fn prometheus_metrics(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    let body = fngate_metrics::render_prometheus(&gateway.metrics.snapshot(), &gateway.gauges());
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
