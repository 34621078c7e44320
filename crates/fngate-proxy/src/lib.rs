//! fngate-proxy — the synchronous invocation path.
//!
//! Turns an admitted request for a function into an HTTP exchange with one
//! of its replicas and streams the answer back.
//!
//! # Architecture
//!
//! ```text
//! InvocationProxy::invoke(InvocationRequest<B>)
//!   ├── Resolver            identity → ReplicaSet snapshot (TTL cache)
//!   │     ├── weighted round-robin, or stable hash of the call ID
//!   │     ├── HealthRegistry filter (never quarantined / unready)
//!   │     └── service VIP when no replica addresses are known
//!   ├── ConnectionPool      keep-alive HTTP/1 senders per scheme+host+port
//!   ├── headers             hop-by-hop stripping, X-Call-Id, X-Forwarded-*
//!   └── ResponseBody        streams upstream bytes, enforces the deadline,
//!                           returns the connection and emits the Observation
//! ReplicaSync                periodic orchestrator reconciliation + probes
//! HttpProvider               faas-provider REST driver
//! ```
//!
//! `B` is either [`StreamingBody`] (sync edge, never buffered) or
//! [`BufferedBody`] (async worker, replayable). Only a replayable body can
//! be retried after the request may have reached a replica.

pub mod body;
pub mod client;
pub mod headers;
pub mod pool;
pub mod provider;
pub mod proxy;
pub mod resolver;
pub mod sync;

pub use body::{BoxError, BufferedBody, RequestBody, ResponseBody, StreamingBody, UpstreamBody};
pub use client::{ClientError, ClientResponse, HttpClient};
pub use pool::{ConnectionPool, PoolError, PoolKey, PoolLimits, PoolStats, PooledConnection};
pub use provider::HttpProvider;
pub use proxy::{InvocationProxy, InvocationRequest, InvocationResponse, Invoker};
pub use resolver::{ResolvedEndpoint, Resolver, ResolverConfig, Selection};
pub use sync::{ReplicaSync, SyncStats};
