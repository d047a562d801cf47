//! # Application State
//!
//! Shared state for the Axum application, passed to all route handlers
//! via the `State` extractor.
//!
//! [`AppConfig`] is read from the environment once at startup.
//! [`AppState::with_config`] builds the whole cache from it: the in-memory
//! backend, the store, the eviction reconciler bound to the backend's
//! reclamation channel, and the ingress/egress admission limiters.

use std::sync::Arc;
use std::time::Duration;

use artcache_core::backend::DEFAULT_CAPACITY_BYTES;
use artcache_core::reconciler::BindError;
use artcache_core::{
    AdmissionLimiter, AdmissionPolicy, ArtifactStore, ByteRate, CacheService, EvictionReconciler,
    MemoryBackend,
};
use metrics_exporter_prometheus::PrometheusHandle;
use thiserror::Error;

use crate::middleware::metrics::ApiMetrics;

/// Largest accepted put body unless `MAX_ARTIFACT_BYTES` says otherwise.
pub const DEFAULT_MAX_ARTIFACT_BYTES: usize = 256 * 1024 * 1024;

/// Deadline for `ADMISSION_POLICY=reject-after` unless `ADMISSION_TIMEOUT_MS` is set.
pub const DEFAULT_ADMISSION_TIMEOUT: Duration = Duration::from_secs(5);

/// An environment variable held a value that could not be used.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{var}={value:?} is invalid: {reason}")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
    pub reason: String,
}

/// Application configuration.
#[derive(Clone)]
pub struct AppConfig {
    /// Port to bind the HTTP server to.
    pub port: u16,
    /// Accepted `Authorization` header values. Empty disables auth.
    pub auth_tokens: Vec<String>,
    /// Backend capacity in payload bytes.
    pub capacity_bytes: u64,
    /// Ingress byte rate; `None` is unlimited.
    pub ingress: Option<ByteRate>,
    /// Egress byte rate; `None` is unlimited.
    pub egress: Option<ByteRate>,
    /// What the limiters do when budget is short.
    pub admission_policy: AdmissionPolicy,
    /// Largest accepted put body.
    pub max_artifact_bytes: usize,
    /// Emit logs as JSON lines.
    pub log_json: bool,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("port", &self.port)
            .field(
                "auth_tokens",
                &format_args!("[{} REDACTED]", self.auth_tokens.len()),
            )
            .field("capacity_bytes", &self.capacity_bytes)
            .field("ingress", &self.ingress)
            .field("egress", &self.egress)
            .field("admission_policy", &self.admission_policy)
            .field("max_artifact_bytes", &self.max_artifact_bytes)
            .field("log_json", &self.log_json)
            .finish()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            auth_tokens: Vec::new(),
            capacity_bytes: DEFAULT_CAPACITY_BYTES,
            ingress: None,
            egress: None,
            admission_policy: AdmissionPolicy::default(),
            max_artifact_bytes: DEFAULT_MAX_ARTIFACT_BYTES,
            log_json: false,
        }
    }
}

impl AppConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Read configuration through `lookup`. Unset or blank variables take
    /// their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let port = parse_or(&get, "PORT", defaults.port)?;
        let auth_tokens: Vec<String> = get("AUTH_TOKENS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let capacity_bytes = parse_or(&get, "CACHE_CAPACITY_BYTES", defaults.capacity_bytes)?;
        let max_artifact_bytes = parse_or(&get, "MAX_ARTIFACT_BYTES", defaults.max_artifact_bytes)?;

        let burst: Option<u64> = parse_opt(&get, "ADMISSION_BURST_BYTES")?;
        let rate = |var: &'static str| -> Result<Option<ByteRate>, ConfigError> {
            Ok(parse_opt::<u64>(&get, var)?
                .filter(|&bytes_per_sec| bytes_per_sec > 0)
                .map(|bytes_per_sec| ByteRate {
                    bytes_per_sec,
                    burst_bytes: burst.unwrap_or(bytes_per_sec),
                }))
        };
        let ingress = rate("INGRESS_BYTES_PER_SEC")?;
        let egress = rate("EGRESS_BYTES_PER_SEC")?;

        let timeout = parse_opt::<u64>(&get, "ADMISSION_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_ADMISSION_TIMEOUT);
        let admission_policy = match get("ADMISSION_POLICY").as_deref() {
            None | Some("block") => AdmissionPolicy::BlockUntilAvailable,
            Some("reject") => AdmissionPolicy::RejectImmediately,
            Some("reject-after") => AdmissionPolicy::RejectAfter(timeout),
            Some(other) => {
                return Err(ConfigError {
                    var: "ADMISSION_POLICY",
                    value: other.to_string(),
                    reason: "expected one of block, reject, reject-after".to_string(),
                })
            }
        };

        let log_json = matches!(get("LOG_FORMAT").as_deref(), Some("json"));

        Ok(Self {
            port,
            auth_tokens,
            capacity_bytes,
            ingress,
            egress,
            admission_policy,
            max_artifact_bytes,
            log_json,
        })
    }
}

fn parse_opt<T>(get: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(value) = get(var) else {
        return Ok(None);
    };
    match value.parse() {
        Ok(parsed) => Ok(Some(parsed)),
        Err(e) => Err(ConfigError {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    Ok(parse_opt(get, var)?.unwrap_or(default))
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<CacheService>,
    pub config: AppConfig,
    pub metrics: ApiMetrics,
    /// Renders `/metrics`; `None` when no exporter is installed.
    pub prometheus: Option<PrometheusHandle>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("service", &self.service)
            .field("config", &self.config)
            .field("prometheus", &self.prometheus.is_some())
            .finish()
    }
}

impl AppState {
    /// Build the cache described by `config` and bind its reconciler.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_config(config: AppConfig) -> Result<Self, BindError> {
        let backend = Arc::new(MemoryBackend::new(config.capacity_bytes));
        let store = Arc::new(ArtifactStore::new(backend));
        // The task runs until the backend drops its sender.
        let _reconciler = EvictionReconciler::bind(Arc::clone(&store))?;

        let service = CacheService::new(
            store,
            AdmissionLimiter::from_rate("ingress", config.ingress, config.admission_policy),
            AdmissionLimiter::from_rate("egress", config.egress, config.admission_policy),
        );
        Ok(Self::from_service(Arc::new(service), config))
    }

    /// Default configuration.
    pub fn new() -> Result<Self, BindError> {
        Self::with_config(AppConfig::default())
    }

    /// Wrap an already-built service. The caller owns reconciler binding.
    pub fn from_service(service: Arc<CacheService>, config: AppConfig) -> Self {
        Self {
            service,
            config,
            metrics: ApiMetrics::new(),
            prometheus: None,
        }
    }

    /// Serve `handle` at `/metrics`.
    pub fn with_prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }
}
