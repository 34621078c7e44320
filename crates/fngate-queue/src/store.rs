//! RedbBroker — durable broker backed by redb.
//!
//! Each stored message carries its visibility time, delivery count, and the
//! token of the current lease. Receiving claims the oldest visible message
//! inside one write transaction, so two workers can never hold the same
//! lease. Dead-lettering removes the message and writes the record in the
//! same transaction.

use std::path::Path;
use std::pin::pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redb::{Database, ReadableDatabase, ReadableTable};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::{Broker, Delivery, Receipt};
use crate::error::{QueueError, QueueResult};
use crate::message::{DeadLetter, QueueMessage, now_ms};
use crate::tables::*;

/// Convert any `Display` error into a `QueueError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| QueueError::$variant(e.to_string())
    };
}

/// Upper bound on how long `receive` sleeps between scans. Leases that
/// lapse produce no wakeup, so receivers poll at this granularity.
const SCAN_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredMessage {
    message: QueueMessage,
    /// Milliseconds since the epoch at which the message may be leased.
    visible_at: u64,
    deliveries: u32,
    #[serde(default)]
    lease: Option<String>,
}

/// Thread-safe broker backed by redb.
#[derive(Clone)]
pub struct RedbBroker {
    db: Arc<Database>,
    notify: Arc<Notify>,
    visibility_timeout: Duration,
}

impl RedbBroker {
    /// Open (or create) a persistent queue at the given path.
    pub fn open(path: &Path, visibility_timeout: Duration) -> QueueResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let broker = Self::with_db(db, visibility_timeout)?;
        debug!(?path, "queue database opened");
        Ok(broker)
    }

    /// Create an ephemeral in-memory queue (for testing).
    pub fn open_in_memory(visibility_timeout: Duration) -> QueueResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        Self::with_db(db, visibility_timeout)
    }

    fn with_db(db: Database, visibility_timeout: Duration) -> QueueResult<Self> {
        let broker = Self {
            db: Arc::new(db),
            notify: Arc::new(Notify::new()),
            visibility_timeout,
        };
        broker.ensure_tables()?;
        Ok(broker)
    }

    fn ensure_tables(&self) -> QueueResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(MESSAGES).map_err(map_err!(Table))?;
        txn.open_table(DEAD_LETTERS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Lease the oldest visible message, if any.
    fn try_claim(&self, queue: &str) -> QueueResult<Option<Delivery>> {
        let now = now_ms();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let claimed = {
            let mut table = txn.open_table(MESSAGES).map_err(map_err!(Table))?;
            let (lo, hi) = queue_range(queue);

            let mut found = None;
            for entry in table
                .range(lo.as_str()..hi.as_str())
                .map_err(map_err!(Read))?
            {
                let (key, value) = entry.map_err(map_err!(Read))?;
                let stored: StoredMessage =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if stored.visible_at <= now {
                    found = Some((key.value().to_string(), stored));
                    break;
                }
            }

            match found {
                Some((key, mut stored)) => {
                    let token = Uuid::new_v4().to_string();
                    stored.message.attempt = stored.deliveries;
                    stored.deliveries += 1;
                    stored.visible_at = now + self.visibility_timeout.as_millis() as u64;
                    stored.lease = Some(token.clone());

                    let value = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;
                    table
                        .insert(key.as_str(), value.as_slice())
                        .map_err(map_err!(Write))?;

                    Some(Delivery {
                        message: stored.message,
                        receipt: Receipt { key, token },
                        leased_until: Instant::now() + self.visibility_timeout,
                    })
                }
                None => None,
            }
        };

        match claimed {
            Some(delivery) => {
                txn.commit().map_err(map_err!(Transaction))?;
                debug!(
                    message_id = %delivery.message.message_id,
                    attempt = delivery.message.attempt,
                    "message leased"
                );
                Ok(Some(delivery))
            }
            None => {
                txn.abort().map_err(map_err!(Transaction))?;
                Ok(None)
            }
        }
    }

    /// Run `update` against the leased record, then commit its result.
    ///
    /// `update` returns `None` to delete the record.
    fn with_lease<F>(&self, receipt: &Receipt, update: F) -> QueueResult<()>
    where
        F: FnOnce(StoredMessage) -> Option<StoredMessage>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(MESSAGES).map_err(map_err!(Table))?;
            let stored = match table.get(receipt.key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => serde_json::from_slice::<StoredMessage>(guard.value())
                    .map_err(map_err!(Deserialize))?,
                None => return Err(QueueError::LeaseLost(receipt.key.clone())),
            };
            if stored.lease.as_deref() != Some(receipt.token.as_str()) {
                return Err(QueueError::LeaseLost(receipt.key.clone()));
            }

            match update(stored) {
                Some(next) => {
                    let value = serde_json::to_vec(&next).map_err(map_err!(Serialize))?;
                    table
                        .insert(receipt.key.as_str(), value.as_slice())
                        .map_err(map_err!(Write))?;
                }
                None => {
                    table
                        .remove(receipt.key.as_str())
                        .map_err(map_err!(Write))?;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }
}

#[async_trait]
impl Broker for RedbBroker {
    async fn publish(&self, message: &QueueMessage) -> QueueResult<()> {
        let key = message_key(
            &message.queue_name,
            message.first_enqueued_at,
            &message.message_id.to_string(),
        );
        let stored = StoredMessage {
            message: message.clone(),
            visible_at: 0,
            deliveries: 0,
            lease: None,
        };
        let value = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(MESSAGES).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;

        debug!(%key, message_id = %message.message_id, "message published");
        self.notify.notify_waiters();
        Ok(())
    }

    async fn receive(&self, queue: &str, wait: Duration) -> QueueResult<Option<Delivery>> {
        let deadline = Instant::now() + wait;
        loop {
            // Register for wakeups before scanning so a publish between the
            // scan and the wait is not missed.
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();

            if let Some(delivery) = self.try_claim(queue)? {
                return Ok(Some(delivery));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let nap = (deadline - now).min(SCAN_INTERVAL);
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        self.with_lease(&delivery.receipt, |_| None)?;
        debug!(message_id = %delivery.message.message_id, "message acked");
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, delay: Duration) -> QueueResult<()> {
        let visible_at = now_ms() + delay.as_millis() as u64;
        self.with_lease(&delivery.receipt, |mut stored| {
            stored.visible_at = visible_at;
            stored.lease = None;
            Some(stored)
        })?;
        debug!(
            message_id = %delivery.message.message_id,
            delay_ms = delay.as_millis() as u64,
            "message returned for retry"
        );
        self.notify.notify_waiters();
        Ok(())
    }

    async fn release(&self, delivery: &Delivery, delay: Duration) -> QueueResult<()> {
        let visible_at = now_ms() + delay.as_millis() as u64;
        self.with_lease(&delivery.receipt, |mut stored| {
            stored.visible_at = visible_at;
            stored.deliveries = stored.deliveries.saturating_sub(1);
            stored.lease = None;
            Some(stored)
        })?;
        debug!(message_id = %delivery.message.message_id, "message released unprocessed");
        self.notify.notify_waiters();
        Ok(())
    }

    async fn extend(&self, delivery: &mut Delivery, by: Duration) -> QueueResult<()> {
        let visible_at = now_ms() + by.as_millis() as u64;
        self.with_lease(&delivery.receipt, |mut stored| {
            stored.visible_at = visible_at;
            Some(stored)
        })?;
        delivery.leased_until = Instant::now() + by;
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, record: DeadLetter) -> QueueResult<()> {
        let key = format!(
            "{:016}/{}",
            record.failed_at, record.message.message_id
        );
        let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut messages = txn.open_table(MESSAGES).map_err(map_err!(Table))?;
            let leased = match messages
                .get(delivery.receipt.key.as_str())
                .map_err(map_err!(Read))?
            {
                Some(guard) => {
                    let stored: StoredMessage = serde_json::from_slice(guard.value())
                        .map_err(map_err!(Deserialize))?;
                    stored.lease.as_deref() == Some(delivery.receipt.token.as_str())
                }
                None => false,
            };
            if !leased {
                return Err(QueueError::LeaseLost(delivery.receipt.key.clone()));
            }
            messages
                .remove(delivery.receipt.key.as_str())
                .map_err(map_err!(Write))?;

            let mut dead = txn.open_table(DEAD_LETTERS).map_err(map_err!(Table))?;
            dead.insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;

        warn!(
            message_id = %record.message.message_id,
            call_id = %record.message.call_id,
            function = %record.message.function,
            stage = ?record.stage,
            error = %record.last_error,
            "message dead-lettered"
        );
        Ok(())
    }

    async fn depth(&self) -> QueueResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(MESSAGES).map_err(map_err!(Table))?;
        let mut count = 0;
        for entry in table.iter().map_err(map_err!(Read))? {
            entry.map_err(map_err!(Read))?;
            count += 1;
        }
        Ok(count)
    }

    async fn dead_letters(&self, limit: usize) -> QueueResult<Vec<DeadLetter>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEAD_LETTERS).map_err(map_err!(Table))?;
        let mut records = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))?.rev() {
            if records.len() >= limit {
                break;
            }
            let (_, value) = entry.map_err(map_err!(Read))?;
            records.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(records)
    }

    fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }
}
