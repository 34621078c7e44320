//! Request and response bodies.
//!
//! The sync and async paths differ in one way that matters: whether the
//! request body can be sent twice. That difference lives in the type of the
//! body so the sync edge cannot buffer by accident.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use fngate_core::{GatewayError, Observation, Observer};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, LengthLimitError, Limited};
use hyper::body::{Body, Frame, SizeHint};
use tokio::time::Sleep;

use crate::pool::PooledConnection;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type carried on every upstream request.
pub type UpstreamBody = UnsyncBoxBody<Bytes, BoxError>;

/// A request body the proxy can forward.
pub trait RequestBody: Send + 'static {
    fn into_upstream(self) -> UpstreamBody;

    /// An identical body for a second attempt, if one can be produced.
    fn replay(&self) -> Option<Self>
    where
        Self: Sized;
}

// ── Streaming (sync path) ──────────────────────────────────────

/// A client body forwarded frame by frame, never collected.
pub struct StreamingBody {
    inner: UpstreamBody,
    empty: bool,
}

impl StreamingBody {
    pub fn new<B>(body: B) -> Self
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let empty = body.is_end_stream() || body.size_hint().exact() == Some(0);
        Self {
            inner: body.map_err(Into::into).boxed_unsync(),
            empty,
        }
    }

    pub fn empty() -> Self {
        Self::new(Empty::<Bytes>::new())
    }
}

impl RequestBody for StreamingBody {
    fn into_upstream(self) -> UpstreamBody {
        self.inner
    }

    /// Only a body known to be empty can be replayed.
    fn replay(&self) -> Option<Self> {
        self.empty.then(StreamingBody::empty)
    }
}

// ── Buffered (async path) ──────────────────────────────────────

/// A fully materialized body, bounded at construction.
#[derive(Debug, Clone, Default)]
pub struct BufferedBody(Bytes);

impl BufferedBody {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Collect `body`, failing with `PayloadTooLarge` past `limit` bytes.
    pub async fn read_bounded<B>(body: B, limit: u64) -> Result<Self, GatewayError>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxError>,
    {
        let limited = Limited::new(body, usize::try_from(limit).unwrap_or(usize::MAX));
        match limited.collect().await {
            Ok(collected) => Ok(Self(collected.to_bytes())),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                Err(GatewayError::PayloadTooLarge {
                    size: limit.saturating_add(1),
                    limit,
                })
            }
            Err(e) => Err(GatewayError::Invalid(format!("reading request body: {e}"))),
        }
    }

    pub fn bytes(&self) -> &Bytes {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl RequestBody for BufferedBody {
    fn into_upstream(self) -> UpstreamBody {
        Full::new(self.0)
            .map_err(|never| match never {})
            .boxed_unsync()
    }

    fn replay(&self) -> Option<Self> {
        Some(self.clone())
    }
}

// ── Byte counting ──────────────────────────────────────────────

/// Counts data bytes as they are pulled through.
pub(crate) struct CountingBody {
    inner: UpstreamBody,
    counter: Arc<AtomicU64>,
}

impl CountingBody {
    pub(crate) fn wrap(inner: UpstreamBody, counter: Arc<AtomicU64>) -> UpstreamBody {
        Self { inner, counter }.boxed_unsync()
    }
}

impl Body for CountingBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_frame(cx);
        if let Poll::Ready(Some(Ok(frame))) = &poll {
            if let Some(data) = frame.data_ref() {
                this.counter.fetch_add(data.len() as u64, Ordering::Relaxed);
            }
        }
        poll
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

// ── Response ───────────────────────────────────────────────────

/// Emits the observation for one invocation when its response ends.
pub(crate) struct Completion {
    pub(crate) observer: Arc<dyn Observer>,
    pub(crate) observation: Observation,
    pub(crate) started: Instant,
    pub(crate) sent: Arc<AtomicU64>,
}

impl Completion {
    pub(crate) fn finish(mut self, received: u64) {
        self.observation.duration_ns = self.started.elapsed().as_nanos() as u64;
        self.observation.bytes_out = self.sent.load(Ordering::Relaxed);
        self.observation.bytes_in = received;
        self.observer.observe(&self.observation);
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invocation deadline elapsed while streaming the response")]
pub struct DeadlineElapsed;

/// Response body handed back to callers.
///
/// Upstream bodies are streamed as they arrive. When the upstream signals
/// end of stream the connection goes back to the pool; if the deadline
/// fires first, the stream ends with an error and the connection is
/// discarded. The observation is emitted exactly once, at the end or on
/// drop.
pub struct ResponseBody {
    inner: UpstreamBody,
    deadline: Option<Pin<Box<Sleep>>>,
    conn: Option<PooledConnection>,
    completion: Option<Completion>,
    received: u64,
    finished: bool,
}

impl ResponseBody {
    /// A synthesized body with no upstream behind it.
    pub fn full(bytes: impl Into<Bytes>) -> Self {
        Self::detached(
            Full::new(bytes.into())
                .map_err(|never| match never {})
                .boxed_unsync(),
        )
    }

    pub fn empty() -> Self {
        Self::full(Bytes::new())
    }

    fn detached(inner: UpstreamBody) -> Self {
        Self {
            inner,
            deadline: None,
            conn: None,
            completion: None,
            received: 0,
            finished: false,
        }
    }

    pub(crate) fn upstream(
        inner: UpstreamBody,
        deadline: Option<Instant>,
        conn: PooledConnection,
        completion: Option<Completion>,
    ) -> Self {
        Self {
            inner,
            deadline: deadline
                .map(|d| Box::pin(tokio::time::sleep_until(tokio::time::Instant::from_std(d)))),
            conn: Some(conn),
            completion,
            received: 0,
            finished: false,
        }
    }

    /// Bytes received from upstream so far.
    pub fn received(&self) -> u64 {
        self.received
    }

    fn complete(&mut self, clean: bool) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.deadline = None;
        if let Some(conn) = self.conn.take() {
            if clean {
                conn.release();
            }
        }
        if let Some(completion) = self.completion.take() {
            completion.finish(self.received);
        }
    }
}

impl Body for ResponseBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        if let Some(deadline) = this.deadline.as_mut() {
            if deadline.as_mut().poll(cx).is_ready() {
                this.complete(false);
                return Poll::Ready(Some(Err(Box::new(DeadlineElapsed))));
            }
        }

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.received += data.len() as u64;
                }
                if this.inner.is_end_stream() {
                    this.complete(true);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.complete(false);
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.complete(true);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.finished || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for ResponseBody {
    fn drop(&mut self) {
        // Abandoned mid-stream: the connection is not reusable.
        self.complete(false);
    }
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseBody")
            .field("received", &self.received)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}
