//! Bus configuration.
//!
//! Loaded from YAML files and environment variables into a single `Config`.
//! Every section has defaults, so an empty file (or none at all) yields a
//! working single-process bus over the in-memory broker.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use uuid::Uuid;

use crate::broker::StartFrom;
use crate::codec::Codec;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "relaybus.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "RELAYBUS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "RELAYBUS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "RELAYBUS_LOG";

/// Errors that can occur while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main bus configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Service this process belongs to. Processes of one service share event
    /// consumer groups, so each event is handled once per service.
    pub service_name: String,
    /// Unique name of this process (consumer name and return path).
    pub process_name: String,
    pub codec: Codec,
    pub transport: TransportConfig,
    pub rpc: RpcConfig,
    pub events: EventsConfig,
    pub dispatch: DispatchConfig,
    pub shutdown: ShutdownConfig,
    pub startup: StartupConfig,
    pub reconnect: ReconnectConfig,
    pub validation: ValidationConfig,
    pub state: StateConfig,
    pub metrics: MetricsConfig,
    pub schema: SchemaConfig,
    /// Per-API overrides, keyed by API name.
    pub apis: HashMap<String, ApiConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "default".to_string(),
            process_name: random_process_name(),
            codec: Codec::default(),
            transport: TransportConfig::default(),
            rpc: RpcConfig::default(),
            events: EventsConfig::default(),
            dispatch: DispatchConfig::default(),
            shutdown: ShutdownConfig::default(),
            startup: StartupConfig::default(),
            reconnect: ReconnectConfig::default(),
            validation: ValidationConfig::default(),
            state: StateConfig::default(),
            metrics: MetricsConfig::default(),
            schema: SchemaConfig::default(),
            apis: HashMap::new(),
        }
    }
}

fn random_process_name() -> String {
    let mut name = Uuid::new_v4().simple().to_string();
    name.truncate(8);
    name
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `relaybus.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `RELAYBUS_CONFIG` environment variable (if set)
    /// 4. Environment variables with `RELAYBUS` prefix, `__` between levels
    ///    (`RELAYBUS__TRANSPORT__REDIS__URL`)
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Create config for testing: in-memory broker, short timeouts.
    pub fn for_test() -> Self {
        let mut config = Self::default();
        config.transport.redis.block_ms = 20;
        config.rpc.timeout_ms = 1000;
        config.rpc.sweep_interval_ms = 10;
        config.shutdown.grace_period_ms = 500;
        config.startup.connect_attempts = 2;
        config.startup.min_delay_ms = 5;
        config.startup.max_delay_ms = 20;
        config.reconnect.min_delay_ms = 5;
        config.reconnect.max_delay_ms = 50;
        config
    }

    /// Reject values the bus cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::Invalid("service_name must not be empty".into()));
        }
        if self.process_name.is_empty() {
            return Err(ConfigError::Invalid("process_name must not be empty".into()));
        }
        if self.dispatch.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "dispatch.max_concurrency must be at least 1".into(),
            ));
        }
        if self.dispatch.intake_buffer == 0 {
            return Err(ConfigError::Invalid(
                "dispatch.intake_buffer must be at least 1".into(),
            ));
        }
        if self.rpc.sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "rpc.sweep_interval_ms must be at least 1".into(),
            ));
        }
        if self.transport.redis.block_ms == 0 {
            return Err(ConfigError::Invalid(
                "transport.redis.block_ms must be at least 1".into(),
            ));
        }
        if self.schema.share && self.schema.ttl_secs == 0 {
            return Err(ConfigError::Invalid(
                "schema.ttl_secs must be at least 1".into(),
            ));
        }
        if self.schema.share && self.schema.refresh_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "schema.refresh_interval_ms must be at least 1".into(),
            ));
        }
        if self.transport.redis.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "transport.redis.batch_size must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Default call timeout for an API, honouring per-API overrides.
    pub fn rpc_timeout(&self, api_name: &str) -> Duration {
        self.apis
            .get(api_name)
            .and_then(|api| api.rpc_timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.rpc.timeout())
    }
}

/// Broker selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    /// In-process broker.
    #[default]
    Memory,
    /// Redis streams.
    Redis,
}

/// Transport configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    #[serde(rename = "type")]
    pub transport_type: TransportType,
    pub redis: RedisConfig,
}

/// Redis and broker-read tuning. Key prefix and read sizing also apply to the
/// in-memory broker.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    /// Prefix for every stream and list key.
    pub key_prefix: String,
    /// Maximum messages per read.
    pub batch_size: usize,
    /// Blocking read window in milliseconds.
    pub block_ms: u64,
    /// Expiry of per-process result lists in seconds.
    pub result_ttl_secs: u64,
    /// Approximate MAXLEN trimming of streams (0 disables trimming).
    pub stream_max_len: usize,
    /// Claim entries left pending by a consumer idle this long.
    pub reclaim_idle_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "relaybus".to_string(),
            batch_size: 10,
            block_ms: 100,
            result_ttl_secs: 60,
            stream_max_len: 100_000,
            reclaim_idle_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub timeout_ms: u64,
    /// How often expired pending calls are swept.
    pub sweep_interval_ms: u64,
    /// Consume the RPC queues of locally registered APIs. A process with
    /// `serve: false` only calls, publishes and handles events.
    pub serve: bool,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            sweep_interval_ms: 100,
            serve: true,
        }
    }
}

impl RpcConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Where a consumer group created by this service starts reading.
    pub start_from: StartFrom,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Bound on concurrently running handler and listener invocations.
    pub max_concurrency: usize,
    /// Capacity of the queue between broker intake and dispatch.
    pub intake_buffer: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 16,
            intake_buffer: 16,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub grace_period_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 5000,
        }
    }
}

impl ShutdownConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

/// Bounded retry window for reaching the broker when starting.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StartupConfig {
    pub connect_attempts: usize,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 10,
            min_delay_ms: 100,
            max_delay_ms: 5000,
        }
    }
}

/// Backoff between reconnect attempts while running.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 100,
            max_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Unknown target APIs are errors on call and listen. When false,
    /// validation of unknown APIs is left to the serving side.
    pub strict: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self { strict: true }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Publish `internal.state` lifecycle events.
    pub enabled: bool,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Serve `internal.metrics` and publish an event for every RPC and
    /// event this process sends or handles.
    pub enabled: bool,
}

/// Sharing of API schemas through the broker.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    /// Store local schemas on the broker and load the schemas other
    /// processes stored there.
    pub share: bool,
    /// Expiry of a stored schema unless its process refreshes it.
    pub ttl_secs: u64,
    /// How often a running bus re-stores its schemas and loads new ones.
    pub refresh_interval_ms: u64,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            share: true,
            ttl_secs: 24 * 60 * 60,
            refresh_interval_ms: 60_000,
        }
    }
}

impl SchemaConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }
}

/// Per-API overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub rpc_timeout_ms: Option<u64>,
}

#[cfg(test)]
mod tests;
