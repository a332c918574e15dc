//! Configuration management for Floodgate.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::algorithm::{AlgorithmKind, WindowRateLimiter};
use crate::circuit::{CircuitBreaker, CircuitBreakerConfig};
use crate::clock::Clock;
use crate::error::{FloodgateError, Result};
use crate::ratelimit::rules::{parse_policies, PolicyTable};
use crate::ratelimit::{
    ClientIdPolicyProvider, IpAddressPolicyProvider, PolicyProvider, PolicyResolver, RateLimiter,
};
use crate::store::{InMemoryStore, Store};

/// Prefix of environment variables that override file settings.
pub const ENV_PREFIX: &str = "FLOODGATE";

/// Main configuration for a Floodgate deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// Backing store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Circuit breaker configuration
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

/// Backing store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Connection URL for networked stores
    #[serde(default = "default_store_url")]
    pub url: String,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,

    /// Prefix prepended to every store key
    #[serde(default)]
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_store_url(),
            connect_timeout_ms: default_connect_timeout(),
            operation_timeout_ms: default_operation_timeout(),
            key_prefix: String::new(),
        }
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1/".to_string()
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_operation_timeout() -> u64 {
    1000
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    #[serde(default = "default_fault_threshold")]
    pub fault_threshold: u32,

    #[serde(default = "default_fault_window")]
    pub fault_window_secs: u64,

    #[serde(default = "default_open_interval")]
    pub circuit_open_interval_secs: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            fault_threshold: default_fault_threshold(),
            fault_window_secs: default_fault_window(),
            circuit_open_interval_secs: default_open_interval(),
        }
    }
}

fn default_fault_threshold() -> u32 {
    3
}

fn default_fault_window() -> u64 {
    60
}

fn default_open_interval() -> u64 {
    30
}

impl CircuitBreakerSettings {
    pub fn to_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            fault_threshold: self.fault_threshold,
            fault_window: Duration::from_secs(self.fault_window_secs),
            circuit_open_interval: Duration::from_secs(self.circuit_open_interval_secs),
        }
    }
}

/// How clients are identified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[default]
    ClientId,
    IpAddress,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    #[serde(default)]
    pub algorithm: AlgorithmKind,

    /// Keep throttled calls counted instead of rolling them back
    #[serde(default)]
    pub count_throttled_requests: bool,

    /// Path prefixes that are never limited
    #[serde(default)]
    pub whitelisted_paths: Vec<String>,

    /// Request keys that are never limited
    #[serde(default)]
    pub whitelisted_request_keys: Vec<String>,

    /// Policy strings
    #[serde(default)]
    pub policies: Vec<String>,

    /// Optional YAML policy table, loaded after `policies`
    #[serde(default)]
    pub policy_file: Option<String>,

    #[serde(default = "default_client_id_header")]
    pub client_id_header: String,

    #[serde(default)]
    pub provider: ProviderKind,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            algorithm: AlgorithmKind::default(),
            count_throttled_requests: false,
            whitelisted_paths: Vec::new(),
            whitelisted_request_keys: Vec::new(),
            policies: Vec::new(),
            policy_file: None,
            client_id_header: default_client_id_header(),
            provider: ProviderKind::default(),
        }
    }
}

fn default_client_id_header() -> String {
    ClientIdPolicyProvider::DEFAULT_HEADER.to_string()
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl FloodgateConfig {
    /// Load configuration from a file, with `FLOODGATE__SECTION__KEY`
    /// environment variables taking precedence.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| FloodgateError::Config(e.to_string()))
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| FloodgateError::Config(e.to_string()))
    }

    pub fn provider(&self) -> Arc<dyn PolicyProvider> {
        match self.rate_limiting.provider {
            ProviderKind::ClientId => Arc::new(ClientIdPolicyProvider::new(
                self.rate_limiting.client_id_header.as_str(),
            )),
            ProviderKind::IpAddress => Arc::new(IpAddressPolicyProvider),
        }
    }

    /// Build a resolver holding every configured policy and whitelisted path.
    ///
    /// # Errors
    /// Fails on malformed policies and on duplicate registrations.
    pub fn build_resolver(&self) -> Result<PolicyResolver> {
        let mut resolver = PolicyResolver::new(self.provider());
        for path in &self.rate_limiting.whitelisted_paths {
            resolver.add_whitelisted_path(path);
        }

        resolver.add_endpoint_policies(parse_policies(&self.rate_limiting.policies)?)?;
        if let Some(file) = &self.rate_limiting.policy_file {
            resolver.add_endpoint_policies(PolicyTable::from_file(file)?.to_policies()?)?;
        }

        info!(policies = resolver.len(), "Policy table loaded");
        Ok(resolver)
    }

    /// Connect to the configured store.
    pub async fn build_store(&self, clock: Arc<dyn Clock>) -> Result<Arc<dyn Store>> {
        match self.store.backend {
            StoreBackend::Memory => Ok(Arc::new(InMemoryStore::with_clock(clock))),
            #[cfg(feature = "redis-store")]
            StoreBackend::Redis => {
                let config = crate::store::RedisStoreConfig {
                    connect_timeout: Duration::from_millis(self.store.connect_timeout_ms),
                    operation_timeout: Duration::from_millis(self.store.operation_timeout_ms),
                    key_prefix: self.store.key_prefix.clone(),
                };
                let store = crate::store::RedisStore::connect_with_config(&self.store.url, config)
                    .await?;
                Ok(Arc::new(store))
            }
            #[cfg(not(feature = "redis-store"))]
            StoreBackend::Redis => Err(FloodgateError::Config(
                "the redis backend requires the `redis-store` feature".to_string(),
            )),
        }
    }

    /// Assemble the breaker, window limiter, resolver and orchestrator.
    pub fn build_limiter(&self, store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Result<RateLimiter> {
        let breaker = Arc::new(CircuitBreaker::with_clock(
            self.circuit_breaker.to_config(),
            clock.clone(),
        ));
        let backend = WindowRateLimiter::new(self.rate_limiting.algorithm.build(), store, breaker, clock)
            .with_count_throttled_requests(self.rate_limiting.count_throttled_requests);
        let resolver = Arc::new(self.build_resolver()?);

        Ok(RateLimiter::new(Arc::new(backend), resolver)
            .with_whitelisted_request_keys(self.rate_limiting.whitelisted_request_keys.iter().cloned()))
    }
}
