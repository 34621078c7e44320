//! Queue wire format.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A serialized async invocation as stored by the broker.
///
/// `message_id` is assigned once by the publisher and survives every
/// redelivery. `attempt` counts earlier deliveries and is rewritten by the
/// broker on each lease.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    pub message_id: Uuid,
    pub call_id: String,
    pub header: BTreeMap<String, Vec<String>>,
    pub host: String,
    #[serde(with = "body_encoding")]
    pub body: Vec<u8>,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub query_string: String,
    pub function: String,
    pub namespace: String,
    pub queue_name: String,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    pub attempt: u32,
    pub max_attempts: u32,
    /// Milliseconds since the Unix epoch.
    pub first_enqueued_at: u64,
}

impl QueueMessage {
    /// Rebuild a header map. Entries that no longer parse are skipped.
    pub fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, values) in &self.header {
            let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            for value in values {
                if let Ok(value) = HeaderValue::from_str(value) {
                    map.append(name.clone(), value);
                }
            }
        }
        map
    }

    /// Whether this delivery is the last one the retry budget allows.
    pub fn is_final_attempt(&self) -> bool {
        self.attempt + 1 >= self.max_attempts
    }
}

/// Flatten a header map into the wire representation.
///
/// Non UTF-8 values are dropped.
pub fn header_entries(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut entries: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            entries
                .entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }
    entries
}

/// Which stage exhausted its retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadLetterStage {
    Invoke,
    Callback,
}

/// Terminal failure record, kept for operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub message: QueueMessage,
    pub stage: DeadLetterStage,
    pub last_error: String,
    pub failed_at: u64,
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

mod body_encoding {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
