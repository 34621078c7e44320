//! Queue publisher: HTTP invocation → durable message.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use fngate_core::{FunctionIdentity, GatewayConfig, GatewayError, QUEUE_ANNOTATION};
use http::{HeaderMap, Method};
use tracing::{debug, error};
use uuid::Uuid;

use crate::broker::Broker;
use crate::message::{QueueMessage, header_entries, now_ms};

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub default_queue: String,
    pub name_prefix: String,
    /// Largest body accepted, inclusive.
    pub max_body_bytes: u64,
    pub max_attempts: u32,
}

impl From<&GatewayConfig> for PublisherConfig {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            default_queue: config.queue.default_queue.clone(),
            name_prefix: config.queue.name_prefix.clone(),
            max_body_bytes: config.queue.max_body_bytes,
            max_attempts: config.queue.max_attempts.max(1),
        }
    }
}

/// An async invocation accepted at the edge, body already materialized.
#[derive(Debug, Clone)]
pub struct AsyncInvocation {
    pub identity: FunctionIdentity,
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub host: String,
    pub body: Bytes,
    pub call_id: String,
    pub callback_url: Option<String>,
    /// Annotations of the target function, used for queue selection.
    pub annotations: HashMap<String, String>,
}

pub struct Publisher {
    broker: Arc<dyn Broker>,
    config: PublisherConfig,
}

impl Publisher {
    pub fn new(broker: Arc<dyn Broker>, config: PublisherConfig) -> Self {
        Self { broker, config }
    }

    pub fn max_body_bytes(&self) -> u64 {
        self.config.max_body_bytes
    }

    /// Full queue name for a function: its queue annotation if present,
    /// otherwise the default, with the configured prefix.
    pub fn queue_for(&self, annotations: &HashMap<String, String>) -> String {
        let base = annotations
            .get(QUEUE_ANNOTATION)
            .map(String::as_str)
            .filter(|q| is_valid_queue_name(q))
            .unwrap_or(self.config.default_queue.as_str());
        format!("{}{}", self.config.name_prefix, base)
    }

    /// Queue the default worker pool drains.
    pub fn default_queue(&self) -> String {
        format!("{}{}", self.config.name_prefix, self.config.default_queue)
    }

    /// Serialize and durably store an invocation. Returns the message ID
    /// once the broker has accepted it.
    pub async fn enqueue(&self, invocation: AsyncInvocation) -> Result<Uuid, GatewayError> {
        let size = invocation.body.len() as u64;
        if size > self.config.max_body_bytes {
            return Err(GatewayError::PayloadTooLarge {
                size,
                limit: self.config.max_body_bytes,
            });
        }

        let queue_name = self.queue_for(&invocation.annotations);
        let message = QueueMessage {
            message_id: Uuid::new_v4(),
            call_id: invocation.call_id,
            header: header_entries(&invocation.headers),
            host: invocation.host,
            body: invocation.body.to_vec(),
            method: invocation.method.to_string(),
            path: invocation.path,
            query_string: invocation.query.unwrap_or_default(),
            function: invocation.identity.name.clone(),
            namespace: invocation.identity.namespace.clone(),
            queue_name,
            annotations: invocation.annotations.into_iter().collect::<BTreeMap<_, _>>(),
            callback_url: invocation.callback_url,
            attempt: 0,
            max_attempts: self.config.max_attempts,
            first_enqueued_at: now_ms(),
        };

        if let Err(e) = self.broker.publish(&message).await {
            error!(
                function = %invocation.identity,
                call_id = %message.call_id,
                error = %e,
                "enqueue failed"
            );
            return Err(e.into());
        }

        debug!(
            function = %invocation.identity,
            queue = %message.queue_name,
            message_id = %message.message_id,
            call_id = %message.call_id,
            bytes = size,
            "invocation queued"
        );
        Ok(message.message_id)
    }

    /// Current broker depth, fed to admission as the pressure signal.
    pub async fn depth(&self) -> Result<u64, GatewayError> {
        Ok(self.broker.depth().await?)
    }
}

fn is_valid_queue_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use fngate_core::DEFAULT_NAMESPACE;

    use super::*;
    use crate::store::RedbBroker;

    fn publisher(max_body_bytes: u64) -> (Publisher, RedbBroker) {
        let broker = RedbBroker::open_in_memory(Duration::from_secs(30)).unwrap();
        let publisher = Publisher::new(
            Arc::new(broker.clone()),
            PublisherConfig {
                default_queue: "faas-request".into(),
                name_prefix: "gw-".into(),
                max_body_bytes,
                max_attempts: 3,
            },
        );
        (publisher, broker)
    }

    fn invocation(body: &'static [u8]) -> AsyncInvocation {
        let mut headers = HeaderMap::new();
        headers.insert("x-call-id", "call-7".parse().unwrap());
        AsyncInvocation {
            identity: FunctionIdentity::parse("echo", DEFAULT_NAMESPACE).unwrap(),
            method: Method::POST,
            path: "/".into(),
            query: Some("a=1".into()),
            headers,
            host: "gateway:8080".into(),
            body: Bytes::from_static(body),
            call_id: "call-7".into(),
            callback_url: Some("http://sink/".into()),
            annotations: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn body_at_ceiling_is_accepted_one_over_is_rejected() {
        let (publisher, broker) = publisher(4);

        publisher.enqueue(invocation(b"four")).await.unwrap();
        let err = publisher.enqueue(invocation(b"five!")).await.unwrap_err();
        assert!(matches!(err, GatewayError::PayloadTooLarge { size: 5, limit: 4 }));

        assert_eq!(broker.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn enqueued_message_carries_invocation() {
        let (publisher, broker) = publisher(1024);
        let id = publisher.enqueue(invocation(b"hi")).await.unwrap();

        let d = broker
            .receive("gw-faas-request", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(d.message.message_id, id);
        assert_eq!(d.message.body, b"hi");
        assert_eq!(d.message.call_id, "call-7");
        assert_eq!(d.message.query_string, "a=1");
        assert_eq!(d.message.callback_url.as_deref(), Some("http://sink/"));
        assert_eq!(d.message.max_attempts, 3);
        assert_eq!(d.message.header["x-call-id"], vec!["call-7".to_string()]);
    }

    #[tokio::test]
    async fn queue_annotation_selects_queue() {
        let (publisher, _) = publisher(1024);
        let mut annotations = HashMap::new();
        assert_eq!(publisher.queue_for(&annotations), "gw-faas-request");

        annotations.insert(QUEUE_ANNOTATION.to_string(), "slow-jobs".to_string());
        assert_eq!(publisher.queue_for(&annotations), "gw-slow-jobs");

        annotations.insert(QUEUE_ANNOTATION.to_string(), "bad/queue".to_string());
        assert_eq!(publisher.queue_for(&annotations), "gw-faas-request");
    }
}
