//! redb table definitions for the queue.
//!
//! Keys are `&str`, values JSON. Message keys sort by queue and then by
//! enqueue time, so a prefix range over `{queue}/` yields oldest first.

use redb::TableDefinition;

/// Pending and leased messages keyed by `{queue}/{enqueued_ms:016}/{message_id}`.
pub const MESSAGES: TableDefinition<&str, &[u8]> = TableDefinition::new("queue_messages");

/// Dead-letter records keyed by `{failed_ms:016}/{message_id}`.
pub const DEAD_LETTERS: TableDefinition<&str, &[u8]> = TableDefinition::new("queue_dead_letters");

pub fn message_key(queue: &str, enqueued_ms: u64, message_id: &str) -> String {
    format!("{queue}/{enqueued_ms:016}/{message_id}")
}

/// Half-open key range covering every message of `queue`.
pub fn queue_range(queue: &str) -> (String, String) {
    // '0' is the byte after '/'.
    (format!("{queue}/"), format!("{queue}0"))
}
