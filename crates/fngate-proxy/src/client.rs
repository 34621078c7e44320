//! Small buffered HTTP/1 client over the shared connection pool.
//!
//! Used for everything the gateway calls that is not a function: callback
//! URLs, the auth delegate, and a remote faas-provider.

use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderValue};
use http::{Method, Request, StatusCode, Uri};
use http_body_util::BodyExt;

use crate::body::{BufferedBody, RequestBody};
use crate::pool::{ConnectionPool, PoolError, PoolKey};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid url {0:?}")]
    InvalidUrl(String),

    #[error("unsupported scheme in {0:?}, only http is supported")]
    UnsupportedScheme(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request to {0} timed out")]
    Timeout(String),

    #[error("reading response: {0}")]
    Body(String),
}

impl From<PoolError> for ClientError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::Timeout(addr) => ClientError::Timeout(addr),
            other => ClientError::Connect(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Clone)]
pub struct HttpClient {
    pool: ConnectionPool,
    timeout: Duration,
}

impl HttpClient {
    pub fn new(pool: ConnectionPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn get(&self, url: &str, headers: HeaderMap) -> Result<ClientResponse, ClientError> {
        self.request(Method::GET, url, headers, Bytes::new()).await
    }

    pub async fn post(
        &self,
        url: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<ClientResponse, ClientError> {
        self.request(Method::POST, url, headers, body).await
    }

    /// Send one request and read the whole response, all within the
    /// client timeout.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<ClientResponse, ClientError> {
        let uri: Uri = url
            .parse()
            .map_err(|_| ClientError::InvalidUrl(url.to_string()))?;
        match uri.scheme_str() {
            Some("http") => {}
            Some(_) => return Err(ClientError::UnsupportedScheme(url.to_string())),
            None => return Err(ClientError::InvalidUrl(url.to_string())),
        }
        let (Some(host), Some(authority)) = (uri.host(), uri.authority()) else {
            return Err(ClientError::InvalidUrl(url.to_string()));
        };
        let key = PoolKey::http(host, uri.port_u16().unwrap_or(80));
        let target = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let host_header = HeaderValue::from_str(authority.as_str())
            .map_err(|_| ClientError::InvalidUrl(url.to_string()))?;

        let deadline = Instant::now() + self.timeout;
        let target = Target {
            url,
            key,
            path: target,
            host: host_header,
        };
        let exchange = self.exchange(&target, method, headers, body, deadline);
        match tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), exchange).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout(url.to_string())),
        }
    }

    async fn exchange(
        &self,
        target: &Target<'_>,
        method: Method,
        headers: HeaderMap,
        body: Bytes,
        deadline: Instant,
    ) -> Result<ClientResponse, ClientError> {
        let mut conn = self.pool.get(&target.key, deadline).await?;
        let mut fresh = !conn.is_reused();
        loop {
            let mut request = Request::new(BufferedBody::new(body.clone()).into_upstream());
            *request.method_mut() = method.clone();
            *request.uri_mut() = target
                .path
                .parse()
                .map_err(|_| ClientError::InvalidUrl(target.url.to_string()))?;
            *request.headers_mut() = headers.clone();
            request
                .headers_mut()
                .insert(header::HOST, target.host.clone());

            let sent = match conn.ready().await {
                Ok(()) => conn
                    .send(request)
                    .await
                    .map_err(|mut e| (e.take_message().is_some(), e.into_error())),
                Err(e) => Err((true, e)),
            };
            match sent {
                Ok(response) => {
                    let (parts, incoming) = response.into_parts();
                    let body = incoming
                        .collect()
                        .await
                        .map_err(|e| ClientError::Body(e.to_string()))?
                        .to_bytes();
                    conn.release();
                    return Ok(ClientResponse {
                        status: parts.status,
                        headers: parts.headers,
                        body,
                    });
                }
                // A reused connection the server already closed.
                Err((true, _)) if !fresh => {
                    conn = self.pool.connect(&target.key, deadline).await?;
                    fresh = true;
                }
                Err((_, e)) => return Err(ClientError::Connect(e.to_string())),
            }
        }
    }
}

struct Target<'a> {
    url: &'a str,
    key: PoolKey,
    path: String,
    host: HeaderValue,
}

#[cfg(test)]
mod tests {
    use axum::Router;
    use axum::routing::{get, post};

    use super::*;
    use crate::pool::PoolLimits;

    fn client(timeout: Duration) -> HttpClient {
        HttpClient::new(
            ConnectionPool::new(PoolLimits {
                max_idle: 4,
                max_idle_per_host: 4,
                max_active_per_host: 0,
                idle_timeout: Duration::from_secs(30),
            }),
            timeout,
        )
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        address
    }

    #[tokio::test]
    async fn get_and_post_round_trip() {
        let address = serve(
            Router::new()
                .route("/info", get(|| async { "v1" }))
                .route("/sink", post(|body: Bytes| async move { body })),
        )
        .await;
        let client = client(Duration::from_secs(5));

        let info = client
            .get(&format!("http://{address}/info"), HeaderMap::new())
            .await
            .unwrap();
        assert_eq!(info.status, StatusCode::OK);
        assert_eq!(info.body.as_ref(), b"v1");

        let echoed = client
            .post(
                &format!("http://{address}/sink"),
                HeaderMap::new(),
                Bytes::from_static(b"result"),
            )
            .await
            .unwrap();
        assert_eq!(echoed.body.as_ref(), b"result");
    }

    #[tokio::test]
    async fn rejects_https_and_garbage() {
        let client = client(Duration::from_secs(1));
        let err = client.get("https://example.com/", HeaderMap::new()).await.unwrap_err();
        assert!(matches!(err, ClientError::UnsupportedScheme(_)));
        let err = client.get("not a url", HeaderMap::new()).await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn slow_server_times_out() {
        let address = serve(Router::new().route(
            "/",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        ))
        .await;
        let err = client(Duration::from_millis(100))
            .get(&format!("http://{address}/"), HeaderMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Timeout(_)));
    }
}
