//! Remote orchestrator driver speaking the faas-provider REST API.

use async_trait::async_trait;
use bytes::Bytes;
use fngate_core::{
    DeleteFunctionRequest, FunctionDeployment, FunctionIdentity, FunctionProvider, FunctionStatus,
    ProviderError, ProviderInfo, ScaleServiceRequest,
};
use http::header::{self, HeaderMap, HeaderValue};
use http::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::client::{ClientResponse, HttpClient};

pub struct HttpProvider {
    base_url: String,
    client: HttpClient,
}

impl HttpProvider {
    pub fn new(base_url: &str, client: HttpClient) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<ClientResponse, ProviderError> {
        let url = format!("{}{}", self.base_url, path);
        let mut headers = HeaderMap::new();
        if body.is_some() {
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        let response = self
            .client
            .request(method.clone(), &url, headers, body.map(Bytes::from).unwrap_or_default())
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;
        debug!(%method, %url, status = response.status.as_u16(), "provider call");
        Ok(response)
    }

    fn check(response: ClientResponse, subject: &str) -> Result<ClientResponse, ProviderError> {
        let status = response.status;
        if status.is_success() {
            return Ok(response);
        }
        let message = String::from_utf8_lossy(&response.body).trim().to_string();
        Err(match status {
            StatusCode::NOT_FOUND => ProviderError::NotFound(subject.to_string()),
            StatusCode::BAD_REQUEST => ProviderError::BadRequest(message),
            _ => ProviderError::Rejected {
                status: status.as_u16(),
                message,
            },
        })
    }

    fn decode<T: DeserializeOwned>(response: ClientResponse) -> Result<T, ProviderError> {
        serde_json::from_slice(&response.body)
            .map_err(|e| ProviderError::Unavailable(format!("decoding provider response: {e}")))
    }

    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProviderError> {
        serde_json::to_vec(value).map_err(|e| ProviderError::BadRequest(e.to_string()))
    }
}

#[async_trait]
impl FunctionProvider for HttpProvider {
    async fn lookup(&self, identity: &FunctionIdentity) -> Result<FunctionStatus, ProviderError> {
        let path = format!(
            "/system/function/{}?namespace={}",
            identity.name, identity.namespace
        );
        let response = self.call(Method::GET, &path, None).await?;
        let mut status: FunctionStatus = Self::decode(Self::check(response, &identity.to_string())?)?;
        if status.namespace.is_empty() {
            status.namespace = identity.namespace.clone();
        }
        Ok(status)
    }

    async fn list(&self, namespace: &str) -> Result<Vec<FunctionStatus>, ProviderError> {
        let path = format!("/system/functions?namespace={namespace}");
        let response = self.call(Method::GET, &path, None).await?;
        let mut statuses: Vec<FunctionStatus> = Self::decode(Self::check(response, namespace)?)?;
        for status in &mut statuses {
            if status.namespace.is_empty() {
                status.namespace = namespace.to_string();
            }
        }
        Ok(statuses)
    }

    async fn scale(
        &self,
        identity: &FunctionIdentity,
        replicas: u32,
    ) -> Result<(), ProviderError> {
        let body = Self::encode(&ScaleServiceRequest {
            service_name: identity.name.clone(),
            namespace: identity.namespace.clone(),
            replicas,
        })?;
        let path = format!(
            "/system/scale-function/{}?namespace={}",
            identity.name, identity.namespace
        );
        let response = self.call(Method::POST, &path, Some(body)).await?;
        Self::check(response, &identity.to_string()).map(|_| ())
    }

    async fn deploy(&self, deployment: FunctionDeployment) -> Result<(), ProviderError> {
        let body = Self::encode(&deployment)?;
        let response = self.call(Method::POST, "/system/functions", Some(body)).await?;
        Self::check(response, &deployment.service).map(|_| ())
    }

    async fn update(&self, deployment: FunctionDeployment) -> Result<(), ProviderError> {
        let body = Self::encode(&deployment)?;
        let response = self.call(Method::PUT, "/system/functions", Some(body)).await?;
        Self::check(response, &deployment.service).map(|_| ())
    }

    async fn delete(&self, identity: &FunctionIdentity) -> Result<(), ProviderError> {
        let body = Self::encode(&DeleteFunctionRequest {
            function_name: identity.name.clone(),
            namespace: identity.namespace.clone(),
        })?;
        let response = self.call(Method::DELETE, "/system/functions", Some(body)).await?;
        Self::check(response, &identity.to_string()).map(|_| ())
    }

    async fn info(&self) -> Result<ProviderInfo, ProviderError> {
        let response = self.call(Method::GET, "/system/info", None).await?;
        Self::decode(Self::check(response, "info")?)
    }
}
