//! The queue worker pool.
//!
//! ```text
//! run(cancel)
//!   └── N tasks, each:  receive ──▶ process ──▶ receive ...
//!
//! process(delivery)
//!   ├── function at its cap past park_timeout ──▶ release        Parked
//!   ├── invoke, deadline = min(lease − margin, invoke_timeout)
//!   │     ├── failed, attempts left ──▶ nack(backoff)            RetryScheduled
//!   │     ├── failed, final attempt ──▶ dead_letter(invoke)      DeadLettered
//!   │     └── 2xx
//!   │           ├── no callback URL ──────────▶ ack              Acked
//!   │           ├── callback delivered ───────▶ ack              Acked
//!   │           └── callback gave up ─────────▶ dead_letter      DeadLettered
//!   └── broker call failed ──▶ lease lapses, redelivered later   Abandoned
//! ```
//!
//! A message is never acked before its callback has either succeeded or been
//! dead-lettered. On shutdown the tasks stop pulling, in-flight messages get
//! `shutdown_grace` to finish, and whatever is still running after that is
//! released back to the broker without spending an attempt.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use fngate_core::{FunctionIdentity, GatewayConfig, InvocationPath};
use fngate_proxy::headers::{X_CALL_ID, X_CALLBACK_URL};
use fngate_proxy::{BufferedBody, InvocationRequest, Invoker};
use fngate_queue::message::now_ms;
use fngate_queue::{Broker, DeadLetter, DeadLetterStage, Delivery, QueueError};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use http_body_util::BodyExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::callback::{CallbackError, CallbackRequest, CallbackSender};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub queue: String,
    pub concurrency: usize,
    /// Effective per-function cap, already resolved against `concurrency`.
    pub per_function_cap: usize,
    pub park_timeout: Duration,
    /// Kept free at the end of a lease.
    pub visibility_margin: Duration,
    pub invoke_timeout: Duration,
    pub invoke_backoff: Backoff,
    pub callback_backoff: Backoff,
    /// Upper bound on one callback POST, used to size lease extensions.
    pub callback_timeout: Duration,
    pub callback_max_elapsed: Duration,
    pub shutdown_grace: Duration,
    pub poll_wait: Duration,
}

impl WorkerConfig {
    pub fn from_gateway(config: &GatewayConfig, queue: impl Into<String>) -> Self {
        let w = &config.worker;
        Self {
            queue: queue.into(),
            concurrency: w.concurrency.max(1),
            per_function_cap: config.worker_function_cap(),
            park_timeout: w.park_timeout,
            visibility_margin: w.visibility_margin,
            invoke_timeout: config.upstream_timeout,
            invoke_backoff: Backoff::new(w.retry_base, w.retry_max),
            callback_backoff: Backoff::new(w.retry_base, w.retry_max),
            callback_timeout: w.callback_timeout,
            callback_max_elapsed: w.callback_max_elapsed,
            shutdown_grace: w.shutdown_grace,
            poll_wait: w.poll_wait,
        }
    }
}

/// How a single delivery ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Acked,
    RetryScheduled,
    DeadLettered,
    /// The function stayed at its cap; returned without spending an attempt.
    Parked,
    /// Cancelled by shutdown and returned without spending an attempt.
    Released,
    /// The broker refused the terminal call; the lease will lapse.
    Abandoned,
}

impl MessageOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageOutcome::Acked => "acked",
            MessageOutcome::RetryScheduled => "retry_scheduled",
            MessageOutcome::DeadLettered => "dead_lettered",
            MessageOutcome::Parked => "parked",
            MessageOutcome::Released => "released",
            MessageOutcome::Abandoned => "abandoned",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub received: u64,
    pub acked: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub parked: u64,
    pub released: u64,
    pub abandoned: u64,
    pub broker_errors: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    acked: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    parked: AtomicU64,
    released: AtomicU64,
    abandoned: AtomicU64,
    broker_errors: AtomicU64,
}

impl Counters {
    fn record(&self, outcome: MessageOutcome) {
        let counter = match outcome {
            MessageOutcome::Acked => &self.acked,
            MessageOutcome::RetryScheduled => &self.retried,
            MessageOutcome::DeadLettered => &self.dead_lettered,
            MessageOutcome::Parked => &self.parked,
            MessageOutcome::Released => &self.released,
            MessageOutcome::Abandoned => &self.abandoned,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> WorkerReport {
        WorkerReport {
            received: self.received.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            parked: self.parked.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            broker_errors: self.broker_errors.load(Ordering::Relaxed),
        }
    }
}

/// A function's 2xx answer, fully read.
struct FunctionResult {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

pub struct QueueWorker {
    broker: Arc<dyn Broker>,
    invoker: Arc<dyn Invoker>,
    callbacks: Arc<dyn CallbackSender>,
    config: WorkerConfig,
    slots: DashMap<FunctionIdentity, Arc<Semaphore>>,
    counters: Counters,
}

impl QueueWorker {
    pub fn new(
        broker: Arc<dyn Broker>,
        invoker: Arc<dyn Invoker>,
        callbacks: Arc<dyn CallbackSender>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            broker,
            invoker,
            callbacks,
            config,
            slots: DashMap::new(),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn report(&self) -> WorkerReport {
        self.counters.snapshot()
    }

    /// Drain the queue with `concurrency` tasks until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> WorkerReport {
        info!(
            queue = %self.config.queue,
            concurrency = self.config.concurrency,
            per_function_cap = self.config.per_function_cap,
            "queue worker started"
        );

        let abort = CancellationToken::new();
        let mut tasks = JoinSet::new();
        for worker_id in 0..self.config.concurrency.max(1) {
            tasks.spawn(self.clone().drain(worker_id, cancel.clone(), abort.clone()));
        }

        cancel.cancelled().await;
        info!(
            grace_ms = self.config.shutdown_grace.as_millis() as u64,
            "queue worker stopping"
        );
        if tokio::time::timeout(self.config.shutdown_grace, join_all(&mut tasks))
            .await
            .is_err()
        {
            warn!("shutdown grace elapsed, releasing in-flight messages");
            abort.cancel();
            join_all(&mut tasks).await;
        }

        let report = self.report();
        info!(
            received = report.received,
            acked = report.acked,
            retried = report.retried,
            dead_lettered = report.dead_lettered,
            released = report.released,
            "queue worker stopped"
        );
        report
    }

    async fn drain(self: Arc<Self>, worker_id: usize, cancel: CancellationToken, abort: CancellationToken) {
        debug!(worker_id, "worker task started");
        loop {
            let received = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                received = self.broker.receive(&self.config.queue, self.config.poll_wait) => received,
            };
            match received {
                Ok(Some(delivery)) => {
                    self.process_until(delivery, &abort).await;
                }
                Ok(None) => {}
                Err(e) => {
                    self.counters.broker_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(worker_id, error = %e, "receive failed");
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(self.config.poll_wait) => {}
                    }
                }
            }
        }
        debug!(worker_id, "worker task stopped");
    }

    async fn process_until(&self, delivery: Delivery, abort: &CancellationToken) -> MessageOutcome {
        let held = delivery.clone();
        tokio::select! {
            biased;
            () = abort.cancelled() => {
                let outcome = match self.broker.release(&held, Duration::ZERO).await {
                    Ok(()) => MessageOutcome::Released,
                    Err(e) => self.abandon(&held, e),
                };
                info!(
                    message_id = %held.message.message_id,
                    call_id = %held.message.call_id,
                    outcome = outcome.as_str(),
                    "in-flight message cancelled by shutdown"
                );
                self.counters.record(outcome);
                outcome
            }
            outcome = self.process(delivery) => outcome,
        }
    }

    /// Carry one leased message to a terminal broker call.
    pub async fn process(&self, delivery: Delivery) -> MessageOutcome {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        let outcome = self.handle(delivery).await;
        self.counters.record(outcome);
        outcome
    }

    async fn handle(&self, mut delivery: Delivery) -> MessageOutcome {
        let message = &delivery.message;
        let identity = match FunctionIdentity::new(
            &message.function,
            Some(&message.namespace),
            &message.namespace,
        ) {
            Ok(identity) => identity,
            Err(e) => {
                return self
                    .dead_letter(&delivery, DeadLetterStage::Invoke, e.to_string())
                    .await;
            }
        };

        let slot = self.slot(&identity);
        let permit = match tokio::time::timeout(self.config.park_timeout, slot.acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            _ => {
                debug!(
                    function = %identity,
                    message_id = %message.message_id,
                    "function at its concurrency cap, message parked"
                );
                return match self.broker.release(&delivery, self.config.park_timeout).await {
                    Ok(()) => MessageOutcome::Parked,
                    Err(e) => self.abandon(&delivery, e),
                };
            }
        };

        let attempt = message.attempt;
        let budget = delivery
            .lease_remaining()
            .saturating_sub(self.config.visibility_margin)
            .min(self.config.invoke_timeout);
        let request = self.request(&delivery, identity.clone(), Instant::now() + budget);

        let started = Instant::now();
        let result = self.call(request).await;
        drop(permit);

        let result = match result {
            Ok(result) => result,
            Err(error) => {
                warn!(
                    function = %identity,
                    call_id = %delivery.message.call_id,
                    attempt = attempt + 1,
                    max_attempts = delivery.message.max_attempts,
                    error = %error,
                    "async invocation failed"
                );
                if delivery.message.is_final_attempt() {
                    return self.dead_letter(&delivery, DeadLetterStage::Invoke, error).await;
                }
                let delay = self.config.invoke_backoff.delay(attempt);
                return match self.broker.nack(&delivery, delay).await {
                    Ok(()) => MessageOutcome::RetryScheduled,
                    Err(e) => self.abandon(&delivery, e),
                };
            }
        };

        debug!(
            function = %identity,
            call_id = %delivery.message.call_id,
            status = result.status.as_u16(),
            duration_ms = started.elapsed().as_millis() as u64,
            "async invocation succeeded"
        );

        let Some(url) = delivery.message.callback_url.clone() else {
            return self.ack(&delivery).await;
        };
        let callback = CallbackRequest::from_response(
            &url,
            &delivery.message.function,
            &delivery.message.call_id,
            result.status,
            &result.headers,
            result.body,
        );
        match self.deliver(&mut delivery, &callback).await {
            Ok(()) => self.ack(&delivery).await,
            Err(e) => {
                self.dead_letter(&delivery, DeadLetterStage::Callback, e.to_string())
                    .await
            }
        }
    }

    /// Rebuild the invocation the edge accepted.
    fn request(
        &self,
        delivery: &Delivery,
        identity: FunctionIdentity,
        deadline: Instant,
    ) -> InvocationRequest<BufferedBody> {
        let message = &delivery.message;
        let method = Method::from_bytes(message.method.as_bytes()).unwrap_or(Method::POST);
        let mut headers = message.header_map();
        headers.remove(X_CALLBACK_URL);
        if let Ok(value) = HeaderValue::from_str(&message.call_id) {
            headers.insert(X_CALL_ID, value);
        }
        let query = Some(message.query_string.clone()).filter(|q| !q.is_empty());

        InvocationRequest::new(
            identity,
            method,
            message.path.clone(),
            query,
            headers,
            BufferedBody::new(message.body.clone()),
            deadline,
            InvocationPath::Async,
        )
    }

    /// Invoke and read the whole answer. Anything but a 2xx is a failed attempt.
    async fn call(&self, request: InvocationRequest<BufferedBody>) -> Result<FunctionResult, String> {
        let response = self.invoker.invoke(request).await.map_err(|e| e.to_string())?;
        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| format!("reading function response: {e}"))?
            .to_bytes();
        if !parts.status.is_success() {
            return Err(format!("function returned {}", parts.status.as_u16()));
        }
        Ok(FunctionResult {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    }

    /// POST the result until it lands, the receiver refuses it for good, or
    /// the retry window closes. The lease is kept alive throughout.
    async fn deliver(
        &self,
        delivery: &mut Delivery,
        callback: &CallbackRequest,
    ) -> Result<(), CallbackError> {
        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            self.keep_leased(delivery, self.config.callback_timeout).await;
            let error = match self.callbacks.send(callback).await {
                Ok(()) => {
                    debug!(
                        call_id = %callback.call_id,
                        url = %callback.url,
                        attempts = attempt + 1,
                        "callback delivered"
                    );
                    return Ok(());
                }
                Err(e) if e.is_permanent() => return Err(e),
                Err(e) => e,
            };

            let delay = self.config.callback_backoff.delay(attempt);
            if started.elapsed() + delay > self.config.callback_max_elapsed {
                return Err(error);
            }
            debug!(
                call_id = %callback.call_id,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "callback failed, backing off"
            );
            self.keep_leased(delivery, delay + self.config.callback_timeout).await;
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Extend the lease if it would lapse within `upcoming` plus the margin.
    async fn keep_leased(&self, delivery: &mut Delivery, upcoming: Duration) {
        let needed = upcoming + self.config.visibility_margin;
        if delivery.lease_remaining() > needed {
            return;
        }
        let by = self.broker.visibility_timeout().max(needed);
        if let Err(e) = self.broker.extend(delivery, by).await {
            self.counters.broker_errors.fetch_add(1, Ordering::Relaxed);
            warn!(
                message_id = %delivery.message.message_id,
                error = %e,
                "lease extension failed"
            );
        }
    }

    async fn ack(&self, delivery: &Delivery) -> MessageOutcome {
        match self.broker.ack(delivery).await {
            Ok(()) => MessageOutcome::Acked,
            Err(e) => self.abandon(delivery, e),
        }
    }

    async fn dead_letter(
        &self,
        delivery: &Delivery,
        stage: DeadLetterStage,
        last_error: String,
    ) -> MessageOutcome {
        let message = &delivery.message;
        error!(
            function = %message.function,
            namespace = %message.namespace,
            call_id = %message.call_id,
            message_id = %message.message_id,
            attempts = message.attempt + 1,
            stage = ?stage,
            error = %last_error,
            "message dead-lettered"
        );
        let record = DeadLetter {
            message: message.clone(),
            stage,
            last_error,
            failed_at: now_ms(),
        };
        match self.broker.dead_letter(delivery, record).await {
            Ok(()) => MessageOutcome::DeadLettered,
            Err(e) => self.abandon(delivery, e),
        }
    }

    fn abandon(&self, delivery: &Delivery, e: QueueError) -> MessageOutcome {
        self.counters.broker_errors.fetch_add(1, Ordering::Relaxed);
        warn!(
            message_id = %delivery.message.message_id,
            error = %e,
            "broker call failed, message left to its lease"
        );
        MessageOutcome::Abandoned
    }

    fn slot(&self, identity: &FunctionIdentity) -> Arc<Semaphore> {
        if let Some(slot) = self.slots.get(identity) {
            return slot.clone();
        }
        self.slots
            .entry(identity.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.per_function_cap.max(1))))
            .clone()
    }
}

async fn join_all(tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            if e.is_panic() {
                error!(error = %e, "worker task panicked");
            }
        }
    }
}
