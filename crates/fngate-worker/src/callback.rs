//! Delivery of async results to the caller's callback URL.

use async_trait::async_trait;
use bytes::Bytes;
use fngate_proxy::headers::X_CALL_ID;
use fngate_proxy::{ClientError, HttpClient};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;
use tracing::debug;

pub const X_FUNCTION_STATUS: HeaderName = HeaderName::from_static("x-function-status");
pub const X_FUNCTION_NAME: HeaderName = HeaderName::from_static("x-function-name");
const X_DURATION_SECONDS: HeaderName = HeaderName::from_static("x-duration-seconds");

/// Function response headers copied onto the callback.
const MIRRORED: [HeaderName; 6] = [
    header::CONTENT_TYPE,
    header::CONTENT_ENCODING,
    header::CONTENT_LANGUAGE,
    header::CACHE_CONTROL,
    header::ETAG,
    header::LAST_MODIFIED,
];

/// One result to deliver.
#[derive(Debug, Clone)]
pub struct CallbackRequest {
    pub url: String,
    pub function: String,
    pub call_id: String,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl CallbackRequest {
    /// Build a callback from the function's response, keeping only the
    /// mirrored headers.
    pub fn from_response(
        url: &str,
        function: &str,
        call_id: &str,
        status: StatusCode,
        response_headers: &HeaderMap,
        body: Bytes,
    ) -> Self {
        let mut headers = HeaderMap::new();
        for name in MIRRORED {
            for value in response_headers.get_all(&name) {
                headers.append(name.clone(), value.clone());
            }
        }
        if let Some(value) = response_headers.get(&X_DURATION_SECONDS) {
            headers.insert(X_DURATION_SECONDS, value.clone());
        }
        headers.insert(X_FUNCTION_STATUS, HeaderValue::from(status.as_u16()));
        if let Ok(value) = HeaderValue::from_str(function) {
            headers.insert(X_FUNCTION_NAME, value);
        }
        if let Ok(value) = HeaderValue::from_str(call_id) {
            headers.insert(X_CALL_ID, value);
        }
        Self {
            url: url.to_string(),
            function: function.to_string(),
            call_id: call_id.to_string(),
            status,
            headers,
            body,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CallbackError {
    /// Worth another attempt after a backoff.
    #[error("callback failed: {0}")]
    Transient(String),

    /// Retrying cannot help.
    #[error("callback rejected: {0}")]
    Permanent(String),
}

impl CallbackError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, CallbackError::Permanent(_))
    }
}

/// Where results go.
#[async_trait]
pub trait CallbackSender: Send + Sync {
    async fn send(&self, request: &CallbackRequest) -> Result<(), CallbackError>;
}

/// POSTs results over the shared connection pool.
pub struct HttpCallbackSender {
    client: HttpClient,
}

impl HttpCallbackSender {
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CallbackSender for HttpCallbackSender {
    async fn send(&self, request: &CallbackRequest) -> Result<(), CallbackError> {
        let response = self
            .client
            .post(&request.url, request.headers.clone(), request.body.clone())
            .await
            .map_err(|e| match e {
                ClientError::InvalidUrl(_) | ClientError::UnsupportedScheme(_) => {
                    CallbackError::Permanent(e.to_string())
                }
                other => CallbackError::Transient(other.to_string()),
            })?;

        debug!(
            url = %request.url,
            call_id = %request.call_id,
            status = response.status.as_u16(),
            "callback answered"
        );
        classify(response.status)
    }
}

/// 2xx and 3xx are delivered; 408, 429 and 5xx are retried; any other 4xx
/// means the receiver will never take this result.
fn classify(status: StatusCode) -> Result<(), CallbackError> {
    if status.is_success() || status.is_redirection() {
        return Ok(());
    }
    let message = format!("callback endpoint answered {}", status.as_u16());
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            Err(CallbackError::Transient(message))
        }
        s if s.is_client_error() => Err(CallbackError::Permanent(message)),
        _ => Err(CallbackError::Transient(message)),
    }
}
