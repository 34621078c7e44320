//! Error taxonomy surfaced at the HTTP edge.

use std::time::Duration;

use http::StatusCode;
use thiserror::Error;

/// Which gauge tripped when a request is turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Saturation {
    /// Global in-flight ceiling.
    Global,
    /// Per-function in-flight ceiling.
    Function,
    /// Broker depth ceiling on the async path.
    Broker,
}

impl Saturation {
    pub fn as_str(self) -> &'static str {
        match self {
            Saturation::Global => "global concurrency limit reached",
            Saturation::Function => "function concurrency limit reached",
            Saturation::Broker => "async queue is saturated",
        }
    }
}

/// Errors the gateway reports to callers.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("function {0} not found")]
    NotFound(String),

    #[error("function {0} has no ready replicas")]
    NotReady(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("deadline exceeded: {0}")]
    Timeout(String),

    #[error("upstream failure: {0}")]
    UpstreamFailure(String),

    #[error("broker failure: {0}")]
    BrokerFailure(String),

    #[error("{}", .reason.as_str())]
    Admission {
        reason: Saturation,
        retry_after: Duration,
    },

    #[error("payload of {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: u64, limit: u64 },

    #[error("connection pool exhausted for {0}")]
    PoolExhausted(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Retry hint attached to synthesized backpressure responses.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

impl GatewayError {
    /// Stable machine-readable code rendered in error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::NotFound(_) => "NotFound",
            GatewayError::NotReady(_) => "NotReady",
            GatewayError::Invalid(_) => "Invalid",
            GatewayError::Timeout(_) => "Timeout",
            GatewayError::UpstreamFailure(_) => "UpstreamFailure",
            GatewayError::BrokerFailure(_) => "BrokerFailure",
            GatewayError::Admission { .. } => "Admission",
            GatewayError::PayloadTooLarge { .. } => "PayloadTooLarge",
            GatewayError::PoolExhausted(_) => "PoolExhausted",
            GatewayError::Internal(_) => "Internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Invalid(_) => StatusCode::BAD_REQUEST,
            GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::UpstreamFailure(_) => StatusCode::BAD_GATEWAY,
            GatewayError::BrokerFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Admission {
                reason: Saturation::Function,
                ..
            } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Admission { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::PoolExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Value for the `Retry-After` header, if the caller should come back.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GatewayError::Admission { retry_after, .. } => Some(*retry_after),
            GatewayError::PoolExhausted(_)
            | GatewayError::BrokerFailure(_)
            | GatewayError::NotReady(_) => Some(DEFAULT_RETRY_AFTER),
            _ => None,
        }
    }

    /// Message safe to show a caller. Internal detail is withheld.
    pub fn public_message(&self) -> String {
        match self {
            GatewayError::Internal(_) => "internal error".to_string(),
            GatewayError::BrokerFailure(_) => "async queue unavailable".to_string(),
            GatewayError::UpstreamFailure(_) => "function upstream failed".to_string(),
            other => other.to_string(),
        }
    }
}

/// Errors from an orchestrator driver.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("function {0} not found")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("orchestrator unavailable: {0}")]
    Unavailable(String),

    #[error("orchestrator returned status {status}: {message}")]
    Rejected { status: u16, message: String },
}

impl From<ProviderError> for GatewayError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::NotFound(name) => GatewayError::NotFound(name),
            ProviderError::BadRequest(msg) => GatewayError::Invalid(msg),
            other => GatewayError::UpstreamFailure(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(GatewayError::NotFound("f".into()).status_code(), 404);
        assert_eq!(GatewayError::NotReady("f".into()).status_code(), 503);
        assert_eq!(GatewayError::Invalid("x".into()).status_code(), 400);
        assert_eq!(GatewayError::Timeout("x".into()).status_code(), 504);
        assert_eq!(GatewayError::UpstreamFailure("x".into()).status_code(), 502);
        assert_eq!(GatewayError::BrokerFailure("x".into()).status_code(), 503);
        assert_eq!(
            GatewayError::PayloadTooLarge { size: 2, limit: 1 }.status_code(),
            413
        );
        assert_eq!(GatewayError::Internal("x".into()).status_code(), 500);
    }

    #[test]
    fn function_saturation_is_429_global_is_503() {
        let per_fn = GatewayError::Admission {
            reason: Saturation::Function,
            retry_after: Duration::from_secs(2),
        };
        let global = GatewayError::Admission {
            reason: Saturation::Global,
            retry_after: Duration::from_secs(1),
        };
        assert_eq!(per_fn.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(global.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(per_fn.retry_after(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn internal_detail_is_not_public() {
        let err = GatewayError::Internal("redb: table MESSAGES corrupted".into());
        assert_eq!(err.public_message(), "internal error");
        assert!(err.to_string().contains("MESSAGES"));
    }

    #[test]
    fn provider_errors_map_into_gateway_errors() {
        let err: GatewayError = ProviderError::NotFound("echo".into()).into();
        assert!(matches!(err, GatewayError::NotFound(_)));
        let err: GatewayError = ProviderError::Unavailable("refused".into()).into();
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }
}
