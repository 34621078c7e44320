//! JSON error responses.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use fngate_core::GatewayError;
use fngate_proxy::headers::X_CALL_ID;
use serde::Serialize;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// A gateway error bound to the correlation ID of the request it ended.
#[derive(Debug)]
pub struct ApiError {
    pub error: GatewayError,
    pub correlation_id: String,
}

impl ApiError {
    pub fn new(error: GatewayError, correlation_id: impl Into<String>) -> Self {
        Self {
            error,
            correlation_id: correlation_id.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.error.status_code()
    }
}

impl From<GatewayError> for ApiError {
    fn from(error: GatewayError) -> Self {
        Self::new(error, Uuid::new_v4().to_string())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody<'a> {
    code: &'a str,
    message: String,
    correlation_id: &'a str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self.error {
            GatewayError::Internal(_) => {
                error!(call_id = %self.correlation_id, error = %self.error, "internal error")
            }
            _ if status.is_server_error() => {
                warn!(call_id = %self.correlation_id, status = status.as_u16(), error = %self.error, "request failed")
            }
            _ => debug!(call_id = %self.correlation_id, status = status.as_u16(), error = %self.error, "request rejected"),
        }

        let body = ErrorBody {
            code: self.error.code(),
            message: self.error.public_message(),
            correlation_id: &self.correlation_id,
        };
        let mut response = (status, Json(body)).into_response();

        let headers = response.headers_mut();
        if let Some(retry_after) = self.error.retry_after() {
            let secs = retry_after.as_secs_f64().ceil().max(1.0) as u64;
            headers.insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        if let Ok(value) = HeaderValue::from_str(&self.correlation_id) {
            headers.insert(X_CALL_ID, value);
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use fngate_core::Saturation;
    use http_body_util::BodyExt;

    use super::*;

    async fn json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn admission_error_carries_retry_after() {
        let response = ApiError::new(
            GatewayError::Admission {
                reason: Saturation::Global,
                retry_after: Duration::from_millis(1500),
            },
            "call-1",
        )
        .into_response();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "2");
        assert_eq!(response.headers()["x-call-id"], "call-1");
        let body = json(response).await;
        assert_eq!(body["code"], "Admission");
        assert_eq!(body["correlationId"], "call-1");
    }

    #[tokio::test]
    async fn internal_detail_is_withheld() {
        let response =
            ApiError::new(GatewayError::Internal("db at 10.0.0.3 down".into()), "c").into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!response.headers().contains_key(header::RETRY_AFTER));
        assert_eq!(json(response).await["message"], "internal error");
    }

    #[test]
    fn uncorrelated_errors_get_an_id() {
        let err = ApiError::from(GatewayError::NotFound("f".into()));
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert!(Uuid::parse_str(&err.correlation_id).is_ok());
    }
}
