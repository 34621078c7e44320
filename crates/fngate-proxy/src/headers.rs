//! Header rules for forwarded requests and responses.

use std::net::SocketAddr;

use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::Method;
use uuid::Uuid;

pub const X_CALL_ID: HeaderName = HeaderName::from_static("x-call-id");
pub const X_START_TIME: HeaderName = HeaderName::from_static("x-start-time");
pub const X_CALLBACK_URL: HeaderName = HeaderName::from_static("x-callback-url");
pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const IDEMPOTENCY_KEY: HeaderName = HeaderName::from_static("idempotency-key");

/// Headers that describe a single connection and are never forwarded.
const HOP_HEADERS: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Remove hop-by-hop headers, including any named in `Connection`.
pub fn strip_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_HEADERS {
        headers.remove(name);
    }
}

/// Return the request's call ID, generating and inserting one if absent.
pub fn ensure_call_id(headers: &mut HeaderMap) -> String {
    if let Some(existing) = headers
        .get(&X_CALL_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        return existing.to_string();
    }
    let id = Uuid::new_v4().to_string();
    if let Ok(value) = HeaderValue::from_str(&id) {
        headers.insert(X_CALL_ID, value);
    }
    id
}

/// Add `X-Forwarded-Host` and `X-Forwarded-For` unless the caller set them.
pub fn add_forwarded(headers: &mut HeaderMap, client: Option<SocketAddr>) {
    if !headers.contains_key(&X_FORWARDED_HOST) {
        if let Some(host) = headers.get(header::HOST).cloned() {
            headers.insert(X_FORWARDED_HOST, host);
        }
    }
    if !headers.contains_key(&X_FORWARDED_FOR) {
        if let Some(value) = client.and_then(|a| HeaderValue::from_str(&a.ip().to_string()).ok()) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }
}

/// Whether a request may be sent twice without a duplicate side effect.
pub fn is_idempotent(method: &Method, headers: &HeaderMap) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::PUT | Method::DELETE)
        || headers.contains_key(&IDEMPOTENCY_KEY)
}

/// Inbound headers as sent upstream: hop-by-hop and `Host` removed.
pub fn upstream_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = inbound.clone();
    strip_hop_headers(&mut headers);
    headers.remove(header::HOST);
    headers
}

/// Current time as unix nanoseconds, for `X-Start-Time`.
pub fn start_time_value() -> HeaderValue {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    HeaderValue::from(nanos as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_standard_and_listed_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, "keep-alive, x-private".parse().unwrap());
        headers.insert("x-private", "1".parse().unwrap());
        headers.insert(header::TRANSFER_ENCODING, "chunked".parse().unwrap());
        headers.insert(header::CONTENT_TYPE, "text/plain".parse().unwrap());

        strip_hop_headers(&mut headers);

        assert!(headers.get("x-private").is_none());
        assert!(headers.get(header::CONNECTION).is_none());
        assert!(headers.get(header::TRANSFER_ENCODING).is_none());
        assert_eq!(headers[header::CONTENT_TYPE], "text/plain");
    }

    #[test]
    fn call_id_is_kept_or_generated() {
        let mut headers = HeaderMap::new();
        headers.insert(X_CALL_ID, "abc".parse().unwrap());
        assert_eq!(ensure_call_id(&mut headers), "abc");

        let mut headers = HeaderMap::new();
        let generated = ensure_call_id(&mut headers);
        assert!(Uuid::parse_str(&generated).is_ok());
        assert_eq!(headers[X_CALL_ID], generated.as_str());
    }

    #[test]
    fn forwarded_headers_fill_gaps_only() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "gw.example:8080".parse().unwrap());
        add_forwarded(&mut headers, Some("10.1.2.3:5555".parse().unwrap()));
        assert_eq!(headers[X_FORWARDED_HOST], "gw.example:8080");
        assert_eq!(headers[X_FORWARDED_FOR], "10.1.2.3");

        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, "1.1.1.1".parse().unwrap());
        add_forwarded(&mut headers, Some("10.1.2.3:5555".parse().unwrap()));
        assert_eq!(headers[X_FORWARDED_FOR], "1.1.1.1");
    }

    #[test]
    fn idempotency_by_method_or_marker() {
        let empty = HeaderMap::new();
        assert!(is_idempotent(&Method::GET, &empty));
        assert!(is_idempotent(&Method::DELETE, &empty));
        assert!(!is_idempotent(&Method::POST, &empty));

        let mut marked = HeaderMap::new();
        marked.insert(IDEMPOTENCY_KEY, "k1".parse().unwrap());
        assert!(is_idempotent(&Method::POST, &marked));
    }

    #[test]
    fn upstream_headers_drop_host() {
        let mut inbound = HeaderMap::new();
        inbound.insert(header::HOST, "gw".parse().unwrap());
        inbound.insert(header::ACCEPT, "*/*".parse().unwrap());
        let out = upstream_headers(&inbound);
        assert!(out.get(header::HOST).is_none());
        assert_eq!(out[header::ACCEPT], "*/*");
    }
}
