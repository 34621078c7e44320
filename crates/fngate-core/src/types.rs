//! Core domain types shared across the gateway.

use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// Namespace substituted when a caller names a function without one.
pub const DEFAULT_NAMESPACE: &str = "openfaas-fn";

/// Port the function watchdog listens on behind a service VIP.
pub const DEFAULT_FUNCTION_PORT: u16 = 8080;

/// Annotation selecting the async queue for a function.
pub const QUEUE_ANNOTATION: &str = "com.openfaas.queue";

static LABEL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,63}$").expect("valid identity pattern"));

// ── Function identity ──────────────────────────────────────────

/// The `(name, namespace)` pair every request, scale call, and metric is keyed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionIdentity {
    pub name: String,
    pub namespace: String,
}

impl FunctionIdentity {
    /// Build an identity from already separated parts.
    ///
    /// An empty or absent namespace falls back to `default_namespace`.
    pub fn new(
        name: &str,
        namespace: Option<&str>,
        default_namespace: &str,
    ) -> Result<Self, GatewayError> {
        let namespace = match namespace {
            Some(ns) if !ns.is_empty() => ns,
            _ => default_namespace,
        };

        if !LABEL_PATTERN.is_match(name) {
            return Err(GatewayError::Invalid(format!(
                "function name {name:?} must match [A-Za-z0-9_-]{{1,63}}"
            )));
        }
        if !LABEL_PATTERN.is_match(namespace) {
            return Err(GatewayError::Invalid(format!(
                "namespace {namespace:?} must match [A-Za-z0-9_-]{{1,63}}"
            )));
        }

        Ok(Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
        })
    }

    /// Parse the `name` or `name.namespace` form used in request paths.
    ///
    /// The namespace is everything after the last dot.
    pub fn parse(raw: &str, default_namespace: &str) -> Result<Self, GatewayError> {
        match raw.rsplit_once('.') {
            Some((name, namespace)) => Self::new(name, Some(namespace), default_namespace),
            None => Self::new(raw, None, default_namespace),
        }
    }
}

impl fmt::Display for FunctionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.namespace)
    }
}

// ── Replicas ───────────────────────────────────────────────────

/// An addressable backend instance as reported by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaEndpoint {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

impl ReplicaEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            weight: 1,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// `host:port`, the key health state is tracked under.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Routing eligibility of a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaHealth {
    Ready,
    Unready,
    Quarantined,
}

impl ReplicaHealth {
    pub fn is_routable(self) -> bool {
        self == ReplicaHealth::Ready
    }
}

/// A replica together with the health the gateway currently assigns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replica {
    pub endpoint: ReplicaEndpoint,
    pub health: ReplicaHealth,
}

// ── Orchestrator DTOs ──────────────────────────────────────────

/// Orchestrator view of a deployed function.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionStatus {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub image: String,
    /// Desired replica count.
    #[serde(default)]
    pub replicas: u32,
    #[serde(default)]
    pub available_replicas: u32,
    #[serde(default)]
    pub invocation_count: f64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_process: Option<String>,
    /// Direct replica addresses, when the orchestrator exposes them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<ReplicaEndpoint>,
}

impl FunctionStatus {
    pub fn identity(&self, default_namespace: &str) -> Result<FunctionIdentity, GatewayError> {
        FunctionIdentity::new(&self.name, Some(&self.namespace), default_namespace)
    }
}

/// Create/update request body for `/system/functions`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDeployment {
    pub service: String,
    pub image: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_process: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env_vars: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,
}

/// Body of `DELETE /system/functions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteFunctionRequest {
    pub function_name: String,
    #[serde(default)]
    pub namespace: String,
}

/// Body of `POST /system/scale-function/{name}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleServiceRequest {
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub namespace: String,
    pub replicas: u32,
}

/// Orchestrator description returned by `info`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub provider: String,
    pub orchestration: String,
    pub version: ProviderVersion,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderVersion {
    pub release: String,
    #[serde(default)]
    pub sha: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_name_uses_default_namespace() {
        let id = FunctionIdentity::parse("echo", DEFAULT_NAMESPACE).unwrap();
        assert_eq!(id.name, "echo");
        assert_eq!(id.namespace, DEFAULT_NAMESPACE);
    }

    #[test]
    fn parse_splits_on_last_dot() {
        let id = FunctionIdentity::parse("echo.staging", DEFAULT_NAMESPACE).unwrap();
        assert_eq!(id.name, "echo");
        assert_eq!(id.namespace, "staging");
        assert_eq!(id.to_string(), "echo.staging");

        // "a.b" is not a valid label, so the leftover name is rejected.
        assert!(FunctionIdentity::parse("a.b.c", DEFAULT_NAMESPACE).is_err());
    }

    #[test]
    fn empty_namespace_falls_back_to_default() {
        let id = FunctionIdentity::new("echo", Some(""), "fns").unwrap();
        assert_eq!(id.namespace, "fns");
    }

    #[test]
    fn identity_rejects_malformed_labels() {
        let long = "x".repeat(64);
        for bad in ["", "has space", "slash/name", "ümlaut", long.as_str()] {
            let err = FunctionIdentity::new(bad, None, DEFAULT_NAMESPACE).unwrap_err();
            assert!(matches!(err, GatewayError::Invalid(_)), "{bad:?} accepted");
        }
        assert!(FunctionIdentity::new(&"x".repeat(63), None, DEFAULT_NAMESPACE).is_ok());
        assert!(FunctionIdentity::new("echo", Some("bad ns"), DEFAULT_NAMESPACE).is_err());
    }

    #[test]
    fn trailing_dot_means_empty_namespace() {
        let id = FunctionIdentity::parse("echo.", "fns").unwrap();
        assert_eq!(id.namespace, "fns");
    }

    #[test]
    fn function_status_uses_camel_case() {
        let json = r#"{"name":"echo","namespace":"fns","replicas":2,"availableReplicas":1,
            "labels":{"com.openfaas.scale.max":"5"},
            "endpoints":[{"host":"10.0.0.1","port":8080}]}"#;
        let status: FunctionStatus = serde_json::from_str(json).unwrap();
        assert_eq!(status.available_replicas, 1);
        assert_eq!(status.endpoints[0].weight, 1);
        assert_eq!(status.labels["com.openfaas.scale.max"], "5");

        let back = serde_json::to_value(&status).unwrap();
        assert_eq!(back["availableReplicas"], 1);
    }

    #[test]
    fn only_ready_replicas_are_routable() {
        assert!(ReplicaHealth::Ready.is_routable());
        assert!(!ReplicaHealth::Unready.is_routable());
        assert!(!ReplicaHealth::Quarantined.is_routable());
    }
}
