//! Orchestrator capability.
//!
//! The gateway never talks to Kubernetes or Swarm directly. Everything it
//! needs from the orchestrator goes through [`FunctionProvider`], so drivers
//! are swappable: a remote faas-provider over HTTP in production, the
//! in-process [`MemoryProvider`] for standalone mode and tests.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::types::*;

#[async_trait]
pub trait FunctionProvider: Send + Sync {
    async fn lookup(&self, identity: &FunctionIdentity) -> Result<FunctionStatus, ProviderError>;

    async fn list(&self, namespace: &str) -> Result<Vec<FunctionStatus>, ProviderError>;

    async fn scale(&self, identity: &FunctionIdentity, replicas: u32)
    -> Result<(), ProviderError>;

    async fn deploy(&self, deployment: FunctionDeployment) -> Result<(), ProviderError>;

    async fn update(&self, deployment: FunctionDeployment) -> Result<(), ProviderError>;

    async fn delete(&self, identity: &FunctionIdentity) -> Result<(), ProviderError>;

    async fn info(&self) -> Result<ProviderInfo, ProviderError>;
}

/// In-process orchestrator backed by a map.
///
/// Replica endpoints are registered explicitly; scaling only changes the
/// reported counts. Every scale call is recorded so callers can assert on
/// how often the orchestrator was asked to act.
pub struct MemoryProvider {
    default_namespace: String,
    functions: RwLock<HashMap<FunctionIdentity, FunctionStatus>>,
    scale_calls: RwLock<Vec<(FunctionIdentity, u32)>>,
    lookups: AtomicU64,
}

impl MemoryProvider {
    pub fn new(default_namespace: &str) -> Self {
        Self {
            default_namespace: default_namespace.to_string(),
            functions: RwLock::new(HashMap::new()),
            scale_calls: RwLock::new(Vec::new()),
            lookups: AtomicU64::new(0),
        }
    }

    /// Insert or replace a function status as-is.
    pub fn insert(&self, mut status: FunctionStatus) -> Result<FunctionIdentity, ProviderError> {
        let identity = status
            .identity(&self.default_namespace)
            .map_err(|e| ProviderError::BadRequest(e.to_string()))?;
        status.namespace = identity.namespace.clone();
        self.functions
            .write()
            .expect("functions lock")
            .insert(identity.clone(), status);
        Ok(identity)
    }

    /// Replace the replica endpoints of a function, updating the counts to match.
    pub fn set_endpoints(
        &self,
        identity: &FunctionIdentity,
        endpoints: Vec<ReplicaEndpoint>,
    ) -> Result<(), ProviderError> {
        let mut functions = self.functions.write().expect("functions lock");
        let status = functions
            .get_mut(identity)
            .ok_or_else(|| ProviderError::NotFound(identity.to_string()))?;
        status.available_replicas = endpoints.len() as u32;
        status.replicas = status.replicas.max(status.available_replicas);
        status.endpoints = endpoints;
        Ok(())
    }

    /// Every `(function, replicas)` pair passed to `scale`, in call order.
    pub fn scale_calls(&self) -> Vec<(FunctionIdentity, u32)> {
        self.scale_calls.read().expect("scale lock").clone()
    }

    /// Number of `lookup` calls served.
    pub fn lookup_count(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl FunctionProvider for MemoryProvider {
    async fn lookup(&self, identity: &FunctionIdentity) -> Result<FunctionStatus, ProviderError> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        self.functions
            .read()
            .expect("functions lock")
            .get(identity)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(identity.to_string()))
    }

    async fn list(&self, namespace: &str) -> Result<Vec<FunctionStatus>, ProviderError> {
        let functions = self.functions.read().expect("functions lock");
        let mut statuses: Vec<_> = functions
            .iter()
            .filter(|(id, _)| id.namespace == namespace)
            .map(|(_, status)| status.clone())
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(statuses)
    }

    async fn scale(
        &self,
        identity: &FunctionIdentity,
        replicas: u32,
    ) -> Result<(), ProviderError> {
        {
            let mut functions = self.functions.write().expect("functions lock");
            let status = functions
                .get_mut(identity)
                .ok_or_else(|| ProviderError::NotFound(identity.to_string()))?;
            status.replicas = replicas;
            // Without real endpoints the fake reports every desired replica as up.
            status.available_replicas = if status.endpoints.is_empty() {
                replicas
            } else {
                replicas.min(status.endpoints.len() as u32)
            };
        }
        self.scale_calls
            .write()
            .expect("scale lock")
            .push((identity.clone(), replicas));
        tracing::debug!(function = %identity, replicas, "memory provider scaled function");
        Ok(())
    }

    async fn deploy(&self, deployment: FunctionDeployment) -> Result<(), ProviderError> {
        let identity = FunctionIdentity::new(
            &deployment.service,
            Some(&deployment.namespace),
            &self.default_namespace,
        )
        .map_err(|e| ProviderError::BadRequest(e.to_string()))?;

        let mut functions = self.functions.write().expect("functions lock");
        if functions.contains_key(&identity) {
            return Err(ProviderError::Rejected {
                status: 409,
                message: format!("function {identity} already exists"),
            });
        }
        functions.insert(identity.clone(), status_from(&identity, deployment, 1));
        Ok(())
    }

    async fn update(&self, deployment: FunctionDeployment) -> Result<(), ProviderError> {
        let identity = FunctionIdentity::new(
            &deployment.service,
            Some(&deployment.namespace),
            &self.default_namespace,
        )
        .map_err(|e| ProviderError::BadRequest(e.to_string()))?;

        let mut functions = self.functions.write().expect("functions lock");
        let existing = functions
            .get(&identity)
            .ok_or_else(|| ProviderError::NotFound(identity.to_string()))?;
        let mut status = status_from(&identity, deployment, existing.replicas);
        status.available_replicas = existing.available_replicas;
        status.endpoints = existing.endpoints.clone();
        functions.insert(identity, status);
        Ok(())
    }

    async fn delete(&self, identity: &FunctionIdentity) -> Result<(), ProviderError> {
        self.functions
            .write()
            .expect("functions lock")
            .remove(identity)
            .map(|_| ())
            .ok_or_else(|| ProviderError::NotFound(identity.to_string()))
    }

    async fn info(&self) -> Result<ProviderInfo, ProviderError> {
        Ok(ProviderInfo {
            provider: "fngate-memory".to_string(),
            orchestration: "in-process".to_string(),
            version: ProviderVersion {
                release: env!("CARGO_PKG_VERSION").to_string(),
                sha: String::new(),
            },
        })
    }
}

fn status_from(
    identity: &FunctionIdentity,
    deployment: FunctionDeployment,
    replicas: u32,
) -> FunctionStatus {
    FunctionStatus {
        name: identity.name.clone(),
        namespace: identity.namespace.clone(),
        image: deployment.image,
        replicas,
        available_replicas: replicas,
        invocation_count: 0.0,
        labels: deployment.labels,
        annotations: deployment.annotations,
        env_process: deployment.env_process,
        endpoints: Vec::new(),
    }
}
