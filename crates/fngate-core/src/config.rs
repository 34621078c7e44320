//! Gateway configuration.
//!
//! A `GatewayConfig` is built once at startup and shared read-only. Values
//! are layered: built-in defaults, then an optional flat TOML file, then
//! environment variables. The TOML file and the environment use the same
//! keys, e.g. `upstream_timeout = "2s"` or `upstream_timeout=2`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::types::{DEFAULT_FUNCTION_PORT, DEFAULT_NAMESPACE};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },

    #[error("reading config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parsing config file: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Where environment-style keys are read from.
pub trait EnvSource {
    fn var(&self, key: &str) -> Option<String>;
}

/// The process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsEnv;

impl EnvSource for OsEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

// ── Sections ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ResolverSettings {
    /// Route to replica endpoints instead of the service VIP.
    pub direct_functions: bool,
    /// Appended to `name.namespace` when building a VIP host.
    pub direct_functions_suffix: String,
    pub function_port: u16,
    pub cache_ttl: Duration,
    /// How long a request may wait for a replica to turn ready.
    pub not_ready_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_idle_conns: usize,
    pub max_idle_conns_per_host: usize,
    /// Ceiling on checked-out connections per host. 0 disables it.
    pub max_conns_per_host: usize,
    pub idle_conn_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct HealthSettings {
    /// Failures inside `failure_window` that mark a replica unready.
    pub failure_threshold: u32,
    pub failure_window: Duration,
    /// Consecutive good probes needed to return to ready.
    pub recovery_probes: u32,
    /// Protocol violations that quarantine a replica.
    pub quarantine_after: u32,
    pub quarantine_cooldown: Duration,
    pub probes_enabled: bool,
    pub probe_path: String,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AdmissionSettings {
    /// 0 means unlimited for all three ceilings.
    pub max_inflight: usize,
    pub max_inflight_per_function: usize,
    pub max_queue_depth: u64,
    pub retry_after: Duration,
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub path: PathBuf,
    pub name_prefix: String,
    pub default_queue: String,
    pub max_body_bytes: u64,
    pub visibility_timeout: Duration,
    pub max_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub concurrency: usize,
    /// Per-function cap on top of the pool. 0 means `concurrency`.
    pub per_function_concurrency: usize,
    pub park_timeout: Duration,
    pub visibility_margin: Duration,
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub callback_timeout: Duration,
    pub callback_max_elapsed: Duration,
    pub shutdown_grace: Duration,
    pub poll_wait: Duration,
}

#[derive(Debug, Clone)]
pub struct ScalingSettings {
    pub alert_name: String,
    pub default_min: u32,
    pub default_max: u32,
    /// Percentage of max added per firing alert when no explicit step is set.
    pub default_factor: u32,
    pub cooldown: Duration,
}

/// Immutable configuration snapshot.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub upstream_timeout: Duration,
    pub default_namespace: String,
    pub functions_provider_url: Option<String>,
    pub auth_proxy_url: Option<String>,
    pub scale_from_zero: bool,
    pub scale_from_zero_grace: Duration,
    pub reconcile_interval: Duration,
    pub resolver: ResolverSettings,
    pub pool: PoolSettings,
    pub health: HealthSettings,
    pub admission: AdmissionSettings,
    pub queue: QueueSettings,
    pub worker: WorkerSettings,
    pub scaling: ScalingSettings,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            read_timeout: Duration::from_secs(8),
            write_timeout: Duration::from_secs(8),
            upstream_timeout: Duration::from_secs(8),
            default_namespace: DEFAULT_NAMESPACE.to_string(),
            functions_provider_url: None,
            auth_proxy_url: None,
            scale_from_zero: false,
            scale_from_zero_grace: Duration::from_secs(30),
            reconcile_interval: Duration::from_secs(5),
            resolver: ResolverSettings {
                direct_functions: false,
                direct_functions_suffix: String::new(),
                function_port: DEFAULT_FUNCTION_PORT,
                cache_ttl: Duration::from_secs(2),
                not_ready_grace: Duration::from_secs(2),
            },
            pool: PoolSettings {
                max_idle_conns: 1024,
                max_idle_conns_per_host: 1024,
                max_conns_per_host: 0,
                idle_conn_timeout: Duration::from_secs(90),
            },
            health: HealthSettings {
                failure_threshold: 3,
                failure_window: Duration::from_secs(10),
                recovery_probes: 2,
                quarantine_after: 3,
                quarantine_cooldown: Duration::from_secs(30),
                probes_enabled: true,
                probe_path: "/_/health".to_string(),
                probe_interval: Duration::from_secs(5),
                probe_timeout: Duration::from_secs(2),
            },
            admission: AdmissionSettings {
                max_inflight: 0,
                max_inflight_per_function: 0,
                max_queue_depth: 0,
                retry_after: Duration::from_secs(1),
            },
            queue: QueueSettings {
                path: PathBuf::from("fngate-queue.redb"),
                name_prefix: String::new(),
                default_queue: "faas-request".to_string(),
                max_body_bytes: 4 * 1024 * 1024,
                visibility_timeout: Duration::from_secs(60),
                max_attempts: 3,
            },
            worker: WorkerSettings {
                concurrency: 4,
                per_function_concurrency: 0,
                park_timeout: Duration::from_secs(2),
                visibility_margin: Duration::from_secs(5),
                retry_base: Duration::from_millis(500),
                retry_max: Duration::from_secs(30),
                callback_timeout: Duration::from_secs(10),
                callback_max_elapsed: Duration::from_secs(60),
                shutdown_grace: Duration::from_secs(10),
                poll_wait: Duration::from_secs(1),
            },
            scaling: ScalingSettings {
                alert_name: "APIHighInvocationRate".to_string(),
                default_min: 1,
                default_max: 20,
                default_factor: 20,
                cooldown: Duration::from_secs(30),
            },
        }
    }
}

/// Every key understood by [`GatewayConfig::apply`].
pub const KNOWN_KEYS: &[&str] = &[
    "port",
    "read_timeout",
    "write_timeout",
    "upstream_timeout",
    "functions_default_namespace",
    "function_namespace",
    "functions_provider_url",
    "auth_proxy_url",
    "scale_from_zero",
    "scale_from_zero_grace",
    "reconcile_interval",
    "direct_functions",
    "direct_functions_suffix",
    "function_port",
    "resolver_cache_ttl",
    "not_ready_grace",
    "max_idle_conns",
    "max_idle_conns_per_host",
    "max_conns_per_host",
    "idle_conn_timeout",
    "health_failure_threshold",
    "health_failure_window",
    "health_recovery_probes",
    "health_quarantine_after",
    "health_quarantine_cooldown",
    "health_probes",
    "health_probe_path",
    "health_probe_interval",
    "health_probe_timeout",
    "max_inflight",
    "max_inflight_per_function",
    "max_queue_depth",
    "retry_after",
    "queue_path",
    "queue_name_prefix",
    "queue_default_name",
    "max_body_bytes",
    "visibility_timeout",
    "max_attempts",
    "worker_concurrency",
    "worker_function_concurrency",
    "worker_park_timeout",
    "worker_visibility_margin",
    "worker_retry_base",
    "worker_retry_max",
    "callback_timeout",
    "callback_max_elapsed",
    "worker_shutdown_grace",
    "worker_poll_wait",
    "scaling_alert_name",
    "scaling_default_min",
    "scaling_default_max",
    "scaling_default_factor",
    "scaling_cooldown",
];

impl GatewayConfig {
    /// Load defaults, overlay `file` if given, then overlay `env`.
    pub fn load(file: Option<&Path>, env: &impl EnvSource) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(path) = file {
            let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            config.apply_toml(&content)?;
        }

        for key in KNOWN_KEYS {
            if let Some(value) = env.var(key) {
                config.apply(key, &value)?;
            }
        }

        Ok(config)
    }

    /// Overlay a flat TOML table using the environment key names.
    pub fn apply_toml(&mut self, content: &str) -> Result<(), ConfigError> {
        let table: toml::Table = toml::from_str(content)?;
        for (key, value) in &table {
            let raw = match value {
                toml::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if !self.apply(key, &raw)? {
                tracing::warn!(%key, "ignoring unknown configuration key");
            }
        }
        Ok(())
    }

    /// Apply a single key. Returns `false` when the key is not recognised.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<bool, ConfigError> {
        let value = value.trim();
        match key {
            "port" => self.port = number(key, value)?,
            "read_timeout" => self.read_timeout = duration(key, value)?,
            "write_timeout" => self.write_timeout = duration(key, value)?,
            "upstream_timeout" => self.upstream_timeout = duration(key, value)?,
            "functions_default_namespace" | "function_namespace" => {
                if !value.is_empty() {
                    self.default_namespace = value.to_string();
                }
            }
            "functions_provider_url" => self.functions_provider_url = optional(value),
            "auth_proxy_url" => self.auth_proxy_url = optional(value),
            "scale_from_zero" => self.scale_from_zero = parse_bool(value),
            "scale_from_zero_grace" => self.scale_from_zero_grace = duration(key, value)?,
            "reconcile_interval" => self.reconcile_interval = duration(key, value)?,

            "direct_functions" => self.resolver.direct_functions = parse_bool(value),
            "direct_functions_suffix" => self.resolver.direct_functions_suffix = value.to_string(),
            "function_port" => self.resolver.function_port = number(key, value)?,
            "resolver_cache_ttl" => self.resolver.cache_ttl = duration(key, value)?,
            "not_ready_grace" => self.resolver.not_ready_grace = duration(key, value)?,

            "max_idle_conns" => self.pool.max_idle_conns = number(key, value)?,
            "max_idle_conns_per_host" => self.pool.max_idle_conns_per_host = number(key, value)?,
            "max_conns_per_host" => self.pool.max_conns_per_host = number(key, value)?,
            "idle_conn_timeout" => self.pool.idle_conn_timeout = duration(key, value)?,

            "health_failure_threshold" => self.health.failure_threshold = number(key, value)?,
            "health_failure_window" => self.health.failure_window = duration(key, value)?,
            "health_recovery_probes" => self.health.recovery_probes = number(key, value)?,
            "health_quarantine_after" => self.health.quarantine_after = number(key, value)?,
            "health_quarantine_cooldown" => {
                self.health.quarantine_cooldown = duration(key, value)?
            }
            "health_probes" => self.health.probes_enabled = parse_bool(value),
            "health_probe_path" => self.health.probe_path = value.to_string(),
            "health_probe_interval" => self.health.probe_interval = duration(key, value)?,
            "health_probe_timeout" => self.health.probe_timeout = duration(key, value)?,

            "max_inflight" => self.admission.max_inflight = number(key, value)?,
            "max_inflight_per_function" => {
                self.admission.max_inflight_per_function = number(key, value)?
            }
            "max_queue_depth" => self.admission.max_queue_depth = number(key, value)?,
            "retry_after" => self.admission.retry_after = duration(key, value)?,

            "queue_path" => self.queue.path = PathBuf::from(value),
            "queue_name_prefix" => self.queue.name_prefix = value.to_string(),
            "queue_default_name" => self.queue.default_queue = value.to_string(),
            "max_body_bytes" => self.queue.max_body_bytes = number(key, value)?,
            "visibility_timeout" => self.queue.visibility_timeout = duration(key, value)?,
            "max_attempts" => self.queue.max_attempts = number(key, value)?,

            "worker_concurrency" => self.worker.concurrency = number(key, value)?,
            "worker_function_concurrency" => {
                self.worker.per_function_concurrency = number(key, value)?
            }
            "worker_park_timeout" => self.worker.park_timeout = duration(key, value)?,
            "worker_visibility_margin" => self.worker.visibility_margin = duration(key, value)?,
            "worker_retry_base" => self.worker.retry_base = duration(key, value)?,
            "worker_retry_max" => self.worker.retry_max = duration(key, value)?,
            "callback_timeout" => self.worker.callback_timeout = duration(key, value)?,
            "callback_max_elapsed" => self.worker.callback_max_elapsed = duration(key, value)?,
            "worker_shutdown_grace" => self.worker.shutdown_grace = duration(key, value)?,
            "worker_poll_wait" => self.worker.poll_wait = duration(key, value)?,

            "scaling_alert_name" => self.scaling.alert_name = value.to_string(),
            "scaling_default_min" => self.scaling.default_min = number(key, value)?,
            "scaling_default_max" => self.scaling.default_max = number(key, value)?,
            "scaling_default_factor" => self.scaling.default_factor = number(key, value)?,
            "scaling_cooldown" => self.scaling.cooldown = duration(key, value)?,

            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Effective per-function cap for the queue worker.
    pub fn worker_function_cap(&self) -> usize {
        match self.worker.per_function_concurrency {
            0 => self.worker.concurrency.max(1),
            n => n,
        }
    }
}

// ── Value parsing ──────────────────────────────────────────────

/// Only the literal `true` enables a flag.
pub fn parse_bool(value: &str) -> bool {
    value == "true"
}

/// Parse a bare integer as seconds, or a suffixed value like `500ms`, `8s`, `2m`, `1h`.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    if let Some(ms) = value.strip_suffix("ms") {
        return ms.parse::<u64>().ok().map(Duration::from_millis);
    }
    if let Some(secs) = value.strip_suffix('s') {
        return secs.parse::<f64>().ok().and_then(|s| Duration::try_from_secs_f64(s).ok());
    }
    if let Some(mins) = value.strip_suffix('m') {
        return mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60));
    }
    if let Some(hours) = value.strip_suffix('h') {
        return hours.parse::<u64>().ok().map(|h| Duration::from_secs(h * 3600));
    }
    None
}

fn duration(key: &str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).ok_or_else(|| ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        reason: "expected seconds or a duration like 500ms, 8s, 2m".to_string(),
    })
}

fn number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.parse::<T>().map_err(|e| ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn optional(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_match_gateway_conventions() {
        let config = GatewayConfig::default();
        assert_eq!(config.upstream_timeout, Duration::from_secs(8));
        assert_eq!(config.pool.max_idle_conns, 1024);
        assert_eq!(config.pool.max_idle_conns_per_host, 1024);
        assert_eq!(config.default_namespace, "openfaas-fn");
        assert!(!config.resolver.direct_functions);
        assert_eq!(config.scaling.default_max, 20);
    }

    #[test]
    fn env_overrides_defaults() {
        let config = GatewayConfig::load(
            None,
            &env(&[
                ("upstream_timeout", "1"),
                ("read_timeout", "500ms"),
                ("direct_functions", "true"),
                ("scale_from_zero", "TRUE"),
                ("max_idle_conns_per_host", "16"),
                ("function_namespace", "fns"),
            ]),
        )
        .unwrap();

        assert_eq!(config.upstream_timeout, Duration::from_secs(1));
        assert_eq!(config.read_timeout, Duration::from_millis(500));
        assert!(config.resolver.direct_functions);
        // Only the lowercase literal counts.
        assert!(!config.scale_from_zero);
        assert_eq!(config.pool.max_idle_conns_per_host, 16);
        assert_eq!(config.default_namespace, "fns");
    }

    #[test]
    fn invalid_number_is_fatal() {
        let err = GatewayConfig::load(None, &env(&[("max_idle_conns", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "max_idle_conns"));
    }

    #[test]
    fn toml_file_is_overridden_by_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        std::fs::write(
            &path,
            "upstream_timeout = \"3s\"\nmax_attempts = 5\ndirect_functions = true\n",
        )
        .unwrap();

        let config =
            GatewayConfig::load(Some(&path), &env(&[("upstream_timeout", "4")])).unwrap();
        assert_eq!(config.upstream_timeout, Duration::from_secs(4));
        assert_eq!(config.queue.max_attempts, 5);
        assert!(config.resolver.direct_functions);
    }

    #[test]
    fn parse_duration_forms() {
        assert_eq!(parse_duration("8"), Some(Duration::from_secs(8)));
        assert_eq!(parse_duration("8s"), Some(Duration::from_secs(8)));
        assert_eq!(parse_duration("1.5s"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("soon"), None);
    }

    #[test]
    fn worker_function_cap_defaults_to_pool_size() {
        let mut config = GatewayConfig::default();
        config.worker.concurrency = 6;
        assert_eq!(config.worker_function_cap(), 6);
        config.worker.per_function_concurrency = 2;
        assert_eq!(config.worker_function_cap(), 2);
    }
}
