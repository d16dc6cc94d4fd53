//! Configuration surface for the orchestration core.
//!
//! All tuning values (caps, windows, thresholds, backoff shape) live here as
//! serde types with sensible defaults, loadable from TOML. Numeric defaults
//! are provider tuning values, not contracts; callers are expected to
//! override them per deployment.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use genrelay_core::ProviderModel;
use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("provider '{0}': max_concurrent must be >= 1")]
    ZeroConcurrency(String),

    #[error("provider '{0}': rate limit max_requests must be >= 1")]
    ZeroRateLimit(String),

    #[error("provider '{0}': rate limit window_ms must be >= 1")]
    ZeroWindow(String),

    #[error("global_max_concurrent must be >= 1")]
    ZeroGlobalConcurrency,

    #[error("breaker failure_threshold must be in (0.0, 1.0], got {0}")]
    BadFailureThreshold(f64),

    #[error("breaker bucket_count and bucket_duration_ms must be >= 1")]
    BadBucketWindow,

    #[error("backoff jitter_factor must be in [0.0, 1.0], got {0}")]
    BadJitterFactor(f64),

    #[error("route for stage '{stage}': invalid candidate spec '{spec}'")]
    BadRouteSpec { stage: String, spec: String },

    #[error("route for stage '{0}' is empty")]
    EmptyRoute(String),
}

/// Sliding-window rate limit for one provider.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 14,
            window_ms: 60_000,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Per-provider limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderLimits {
    #[serde(default = "default_provider_concurrent")]
    pub max_concurrent: u32,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

fn default_provider_concurrent() -> u32 {
    2
}

impl Default for ProviderLimits {
    fn default() -> Self {
        Self {
            max_concurrent: default_provider_concurrent(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

/// Retry bounds and backoff shape.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after transient/timeout failures (attempts = retries + 1).
    #[serde(default = "default_transient_retries")]
    pub max_transient_retries: u32,
    /// Retries after structured-output parse failures.
    #[serde(default = "default_parse_retries")]
    pub max_parse_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Symmetric jitter as a fraction of the computed delay (0.0–1.0).
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

fn default_transient_retries() -> u32 {
    3
}
fn default_parse_retries() -> u32 {
    2
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    15_000
}
fn default_jitter_factor() -> f64 {
    0.25
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_transient_retries: default_transient_retries(),
            max_parse_retries: default_parse_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Circuit-breaker tuning for all `provider:model` keys.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_bucket_count")]
    pub bucket_count: u32,
    #[serde(default = "default_bucket_duration_ms")]
    pub bucket_duration_ms: u64,
    /// Failure ratio at or above which a closed circuit trips.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: f64,
    /// Minimum in-window observations before the ratio is evaluated.
    #[serde(default = "default_minimum_requests")]
    pub minimum_requests: u32,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// Concurrent probe calls admitted while half-open.
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
    /// Consecutive probe successes required to close.
    #[serde(default = "default_half_open_success_threshold")]
    pub half_open_success_threshold: u32,
}

fn default_bucket_count() -> u32 {
    6
}
fn default_bucket_duration_ms() -> u64 {
    10_000
}
fn default_failure_threshold() -> f64 {
    0.5
}
fn default_minimum_requests() -> u32 {
    5
}
fn default_cooldown_ms() -> u64 {
    30_000
}
fn default_half_open_max_calls() -> u32 {
    2
}
fn default_half_open_success_threshold() -> u32 {
    2
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            bucket_count: default_bucket_count(),
            bucket_duration_ms: default_bucket_duration_ms(),
            failure_threshold: default_failure_threshold(),
            minimum_requests: default_minimum_requests(),
            cooldown_ms: default_cooldown_ms(),
            half_open_max_calls: default_half_open_max_calls(),
            half_open_success_threshold: default_half_open_success_threshold(),
        }
    }
}

impl BreakerConfig {
    pub fn bucket_duration(&self) -> Duration {
        Duration::from_millis(self.bucket_duration_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    /// Total sliding-window span: bucket count × bucket duration.
    pub fn window(&self) -> Duration {
        self.bucket_duration() * self.bucket_count
    }
}

/// Top-level configuration for the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_global_concurrent")]
    pub global_max_concurrent: u32,

    /// Per-provider limits; providers not listed get `ProviderLimits::default()`.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub providers: HashMap<String, ProviderLimits>,

    /// Default per-attempt timeout.
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,

    /// Extra wait added after a rate-limit window slot frees up, absorbing
    /// clock skew between admission and the provider's own accounting.
    #[serde(default = "default_safety_buffer_ms")]
    pub rate_limit_safety_buffer_ms: u64,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Minimum interval between coalesced build-state writes.
    #[serde(default = "default_persist_interval_ms")]
    pub persist_interval_ms: u64,

    /// Ordered fallback candidates per generation stage, as
    /// `"provider/model"` specs. Stages not listed use `default_route`.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub routes: HashMap<String, Vec<String>>,

    #[serde(default)]
    pub default_route: Vec<String>,
}

fn default_global_concurrent() -> u32 {
    6
}
fn default_attempt_timeout_ms() -> u64 {
    120_000
}
fn default_safety_buffer_ms() -> u64 {
    50
}
fn default_persist_interval_ms() -> u64 {
    2_000
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            global_max_concurrent: default_global_concurrent(),
            providers: HashMap::new(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            rate_limit_safety_buffer_ms: default_safety_buffer_ms(),
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
            persist_interval_ms: default_persist_interval_ms(),
            routes: HashMap::new(),
            default_route: Vec::new(),
        }
    }
}

impl RelayConfig {
    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Limits for a provider, falling back to defaults for unknown ones.
    pub fn provider_limits(&self, provider: &str) -> ProviderLimits {
        self.providers.get(provider).cloned().unwrap_or_default()
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn safety_buffer(&self) -> Duration {
        Duration::from_millis(self.rate_limit_safety_buffer_ms)
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_millis(self.persist_interval_ms)
    }

    /// Parsed candidate list for a stage (route map, then default route).
    pub fn route_for_stage(&self, stage: &str) -> Result<Vec<ProviderModel>, ConfigError> {
        let specs = self.routes.get(stage).unwrap_or(&self.default_route);
        parse_route(stage, specs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.global_max_concurrent == 0 {
            return Err(ConfigError::ZeroGlobalConcurrency);
        }
        for (name, limits) in &self.providers {
            if limits.max_concurrent == 0 {
                return Err(ConfigError::ZeroConcurrency(name.clone()));
            }
            if limits.rate_limit.max_requests == 0 {
                return Err(ConfigError::ZeroRateLimit(name.clone()));
            }
            if limits.rate_limit.window_ms == 0 {
                return Err(ConfigError::ZeroWindow(name.clone()));
            }
        }
        let t = self.breaker.failure_threshold;
        if !(t > 0.0 && t <= 1.0) {
            return Err(ConfigError::BadFailureThreshold(t));
        }
        if self.breaker.bucket_count == 0 || self.breaker.bucket_duration_ms == 0 {
            return Err(ConfigError::BadBucketWindow);
        }
        let j = self.retry.jitter_factor;
        if !(0.0..=1.0).contains(&j) {
            return Err(ConfigError::BadJitterFactor(j));
        }
        for (stage, specs) in &self.routes {
            parse_route(stage, specs)?;
        }
        Ok(())
    }
}

fn parse_route(stage: &str, specs: &[String]) -> Result<Vec<ProviderModel>, ConfigError> {
    if specs.is_empty() {
        return Err(ConfigError::EmptyRoute(stage.to_string()));
    }
    specs
        .iter()
        .map(|spec| {
            ProviderModel::parse_spec(spec).ok_or_else(|| ConfigError::BadRouteSpec {
                stage: stage.to_string(),
                spec: spec.clone(),
            })
        })
        .collect()
}
