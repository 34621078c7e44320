//! fngate-core — shared vocabulary of the function gateway.
//!
//! Every other fngate crate speaks in these types: the identity a request
//! targets, the replica set an orchestrator reports, the error taxonomy the
//! HTTP edge renders, and the immutable configuration snapshot loaded once at
//! startup.
//!
//! # Layout
//!
//! ```text
//! fngate-core
//!   ├── types     FunctionIdentity, ReplicaEndpoint, FunctionStatus, DTOs
//!   ├── error     GatewayError (edge taxonomy), ProviderError
//!   ├── config    GatewayConfig from defaults → TOML → environment
//!   ├── provider  FunctionProvider capability + MemoryProvider
//!   └── observe   Observation records and the Observer sink
//! ```

pub mod config;
pub mod error;
pub mod observe;
pub mod provider;
pub mod types;

pub use config::{ConfigError, EnvSource, GatewayConfig, OsEnv, parse_bool, parse_duration};
pub use error::{DEFAULT_RETRY_AFTER, GatewayError, ProviderError, Saturation};
pub use observe::{FanOut, InvocationPath, LogObserver, Observation, Observer};
pub use provider::{FunctionProvider, MemoryProvider};
pub use types::*;
