use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::coordination::{CircuitBreakerConfig, RetryPolicy};
use crate::execution::IgConfig;
use crate::feed::{PoolConfig, WebSocketConfig};
use crate::idempotency::UnavailablePolicy;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub brokers: BrokersConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Health server port; no server when unset
    #[serde(default)]
    pub health_port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL; in-memory stores when unset
    #[serde(default)]
    pub url: Option<String>,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FeedTransportKind {
    /// In-process hub, for local runs
    #[default]
    Loopback,
    Websocket,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    #[serde(default)]
    pub transport: FeedTransportKind,
    /// Gateway URL for the websocket transport
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_close_timeout_secs")]
    pub close_timeout_secs: u64,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_close_timeout_secs() -> u64 {
    5
}

fn default_ping_interval_secs() -> u64 {
    30
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            transport: FeedTransportKind::default(),
            url: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            close_timeout_secs: default_close_timeout_secs(),
            ping_interval_secs: default_ping_interval_secs(),
        }
    }
}

impl FeedConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_secs)
    }

    pub fn websocket(&self) -> Option<WebSocketConfig> {
        self.url.as_ref().map(|url| WebSocketConfig {
            connect_timeout: self.connect_timeout(),
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            ..WebSocketConfig::new(url)
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolSettings {
    /// Soft limit; exceeding it only logs a warning
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    /// How long a degraded or circuit-open session may recover on its own
    #[serde(default = "default_recovery_grace_secs")]
    pub recovery_grace_secs: u64,
}

fn default_max_sessions() -> usize {
    1000
}

fn default_health_check_interval_secs() -> u64 {
    30
}

fn default_recovery_grace_secs() -> u64 {
    120
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            health_check_interval_secs: default_health_check_interval_secs(),
            recovery_grace_secs: default_recovery_grace_secs(),
        }
    }
}

impl PoolSettings {
    pub fn to_pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_sessions: self.max_sessions,
            health_check_interval: Duration::from_secs(self.health_check_interval_secs),
            recovery_grace: Duration::from_secs(self.recovery_grace_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_failure_window_secs")]
    pub failure_window_secs: u64,
    #[serde(default = "default_open_secs")]
    pub open_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_failure_window_secs() -> u64 {
    30
}

fn default_open_secs() -> u64 {
    60
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_window_secs: default_failure_window_secs(),
            open_secs: default_open_secs(),
        }
    }
}

impl CircuitBreakerSettings {
    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            failure_window: Duration::from_secs(self.failure_window_secs),
            open_duration: Duration::from_secs(self.open_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_cache_ttl_secs() -> u64 {
    300
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl CacheSettings {
    pub fn to_cache_config(&self) -> CacheConfig {
        let ttl = Duration::from_secs(self.ttl_secs);
        CacheConfig {
            tenant_ttl: ttl,
            channel_ttl: ttl,
            policy_ttl: ttl,
            broker_ttl: ttl,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdempotencyConfig {
    /// `memory` or `postgres`
    #[serde(default = "default_idempotency_backend")]
    pub backend: String,
    #[serde(default = "default_idempotency_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default)]
    pub on_unavailable: UnavailablePolicy,
}

fn default_idempotency_backend() -> String {
    "memory".to_string()
}

fn default_idempotency_ttl_secs() -> u64 {
    24 * 60 * 60
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            backend: default_idempotency_backend(),
            ttl_secs: default_idempotency_ttl_secs(),
            on_unavailable: UnavailablePolicy::default(),
        }
    }
}

impl IdempotencyConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Competing pipeline workers on the inbound queue
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_workers() -> usize {
    4
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// Confirmation polling interval in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Confirmation deadline in milliseconds
    #[serde(default = "default_confirm_timeout")]
    pub confirm_timeout_ms: u64,
    /// Retries for transient submission failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Orders settled concurrently
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

fn default_poll_interval() -> u64 {
    500
}

fn default_confirm_timeout() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_in_flight() -> usize {
    16
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            confirm_timeout_ms: default_confirm_timeout(),
            max_retries: default_max_retries(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokersConfig {
    #[serde(default = "default_ig_live_url")]
    pub ig_live_url: String,
    #[serde(default = "default_ig_demo_url")]
    pub ig_demo_url: String,
    /// Register the paper broker
    #[serde(default = "default_paper_enabled")]
    pub paper_enabled: bool,
}

fn default_ig_live_url() -> String {
    crate::execution::ig::IG_LIVE_URL.to_string()
}

fn default_ig_demo_url() -> String {
    crate::execution::ig::IG_DEMO_URL.to_string()
}

fn default_paper_enabled() -> bool {
    true
}

impl Default for BrokersConfig {
    fn default() -> Self {
        Self {
            ig_live_url: default_ig_live_url(),
            ig_demo_url: default_ig_demo_url(),
            paper_enabled: default_paper_enabled(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CredentialsConfig {
    /// Base64 AES-256 key for stored credentials
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive, overridden by RUST_LOG
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for daily rolling log files
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info,signal_relay=debug,sqlx=warn".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Environment-specific file, e.g. config/production.toml
            .add_source(
                File::from(config_dir.join(
                    std::env::var("RELAY_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // RELAY_DATABASE__URL, RELAY_FEED__TRANSPORT, ...
            .add_source(
                Environment::with_prefix("RELAY")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    pub fn ig_config(&self) -> IgConfig {
        IgConfig {
            live_url: self.brokers.ig_live_url.clone(),
            demo_url: self.brokers.ig_demo_url.clone(),
            confirm_interval: Duration::from_millis(self.execution.poll_interval_ms),
            confirm_timeout: Duration::from_millis(self.execution.confirm_timeout_ms),
            retry: RetryPolicy::with_max_retries(self.execution.max_retries),
            ..IgConfig::default()
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.feed.transport == FeedTransportKind::Websocket && self.feed.url.is_none() {
            errors.push("feed.url is required for the websocket transport".to_string());
        }
        if self.feed.connect_timeout_secs == 0 {
            errors.push("feed.connect_timeout_secs must be positive".to_string());
        }
        if self.pool.health_check_interval_secs == 0 {
            errors.push("pool.health_check_interval_secs must be positive".to_string());
        }
        if self.circuit_breaker.failure_threshold == 0 {
            errors.push("circuit_breaker.failure_threshold must be positive".to_string());
        }
        if self.circuit_breaker.failure_window_secs == 0 || self.circuit_breaker.open_secs == 0 {
            errors.push("circuit_breaker intervals must be positive".to_string());
        }
        if self.cache.ttl_secs == 0 {
            errors.push("cache.ttl_secs must be positive".to_string());
        }

        match self.idempotency.backend.as_str() {
            "memory" => {}
            "postgres" if self.database.url.is_none() => {
                errors.push("idempotency backend postgres requires database.url".to_string())
            }
            "postgres" => {}
            other => errors.push(format!("unknown idempotency backend: {}", other)),
        }
        if self.idempotency.ttl_secs == 0 {
            errors.push("idempotency.ttl_secs must be positive".to_string());
        }

        if self.pipeline.workers == 0 {
            errors.push("pipeline.workers must be at least 1".to_string());
        }
        if self.execution.poll_interval_ms == 0 || self.execution.confirm_timeout_ms == 0 {
            errors.push("execution polling intervals must be positive".to_string());
        }
        if self.execution.poll_interval_ms >= self.execution.confirm_timeout_ms {
            errors.push(
                "execution.poll_interval_ms should be less than confirm_timeout_ms".to_string(),
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
