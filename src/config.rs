// ============================================================================
// CONFIGURATION SYSTEM
// ============================================================================
// Layered configuration:
// - Built-in defaults
// - TOML file
// - `PULSE_` environment overrides (`__` separates nesting levels)
// Everything is validated once at startup; a bad value is fatal.
// ============================================================================

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::detector::Comparison;
use crate::error::ConfigError;
use crate::types::MetricType;
use crate::{
    AGGREGATE_RETENTION_SECS, DEFAULT_ALERT_CAPACITY, DEFAULT_ALERT_LIMIT, DEFAULT_HTTP_ADDR,
    DEFAULT_SUBSCRIBER_QUEUE, DEFAULT_WINDOW_CAPACITY, ENGINE_NAME, INITIAL_SNAPSHOT_SIZE,
    LIVE_WINDOW_MAX_AGE_SECS, MAX_CONFIG_DURATION_SECS, RAW_QUERY_LIMIT, RAW_RETENTION_SECS,
    ROLLUP_INTERVAL_SECS, ROLLUP_LOOKBACK_SECS, SWEEP_INTERVAL_SECS,
};

const ENV_PREFIX: &str = "PULSE_";

// ----------------------------------------------------------------------------
// Root Configuration
// ----------------------------------------------------------------------------

/// Root configuration for the engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: GeneralConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub buffer: BufferConfig,

    #[serde(default)]
    pub alerts: AlertsConfig,

    #[serde(default)]
    pub thresholds: ThresholdsConfig,

    #[serde(default)]
    pub hub: HubConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub rollup: RollupConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub simulator: SimulatorConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        Self::extract(
            Figment::from(Serialized::defaults(Self::default()))
                .merge(Toml::file(path))
                .merge(Env::prefixed(ENV_PREFIX).split("__")),
        )
    }

    /// Defaults plus environment overrides, no file
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract(
            Figment::from(Serialized::defaults(Self::default()))
                .merge(Env::prefixed(ENV_PREFIX).split("__")),
        )
    }

    /// Load from a TOML string (for testing)
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.thresholds.validate()?;

        if self.buffer.capacity == 0 {
            return Err(ConfigError::invalid_value(
                "buffer.capacity",
                "live window capacity must be greater than zero",
            ));
        }
        if self.alerts.capacity == 0 {
            return Err(ConfigError::invalid_value(
                "alerts.capacity",
                "alert capacity must be greater than zero",
            ));
        }
        if self.hub.queue_capacity == 0 {
            return Err(ConfigError::invalid_value(
                "hub.queue_capacity",
                "subscriber queue capacity must be greater than zero",
            ));
        }
        if self.storage.raw_query_limit == 0 {
            return Err(ConfigError::invalid_value(
                "storage.raw_query_limit",
                "raw query limit must be greater than zero",
            ));
        }
        if self.retention.sweep_interval.is_zero() {
            return Err(ConfigError::invalid_value(
                "retention.sweep_interval",
                "sweep interval must be greater than zero",
            ));
        }
        let max_duration = Duration::from_secs(MAX_CONFIG_DURATION_SECS);
        for (field, value) in [
            ("retention.raw_retention", self.retention.raw_retention),
            ("retention.aggregate_retention", self.retention.aggregate_retention),
            ("retention.sweep_interval", self.retention.sweep_interval),
            ("retention.live_window_max_age", self.retention.live_window_max_age),
            ("rollup.interval", self.rollup.interval),
            ("rollup.lookback", self.rollup.lookback),
            ("simulator.interval", self.simulator.interval),
        ] {
            if value > max_duration {
                return Err(ConfigError::invalid_value(
                    field,
                    format!("{value:?} exceeds the maximum of {max_duration:?}"),
                ));
            }
        }
        if self.retention.aggregate_retention < self.retention.raw_retention {
            return Err(ConfigError::invalid_value(
                "retention.aggregate_retention",
                format!(
                    "aggregate retention ({:?}) must not be shorter than raw retention ({:?})",
                    self.retention.aggregate_retention, self.retention.raw_retention,
                ),
            ));
        }
        if self.rollup.enabled && self.rollup.interval.is_zero() {
            return Err(ConfigError::invalid_value(
                "rollup.interval",
                "rollup interval must be greater than zero",
            ));
        }
        if self.simulator.enabled {
            if self.simulator.interval.is_zero() {
                return Err(ConfigError::invalid_value(
                    "simulator.interval",
                    "simulator interval must be greater than zero",
                ));
            }
            if self.simulator.services.iter().any(|s| s.trim().is_empty()) {
                return Err(ConfigError::invalid_value(
                    "simulator.services",
                    "service names must be non-empty",
                ));
            }
        }
        if self.storage.backend == StorageBackend::Wal && self.storage.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::invalid_value(
                "storage.data_dir",
                "a data directory is required for the wal backend",
            ));
        }

        Ok(())
    }

    /// Render the default configuration as TOML
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// General Engine Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Engine instance name (for identification)
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Grace period for background tasks on shutdown
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

fn default_instance_name() -> String {
    ENGINE_NAME.into()
}

fn default_shutdown_timeout() -> u64 {
    10
}

// ----------------------------------------------------------------------------
// Retention
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// How long raw points stay queryable
    #[serde(default = "default_raw_retention", with = "humantime_serde")]
    pub raw_retention: Duration,

    /// How long persisted rollup buckets are kept
    #[serde(default = "default_aggregate_retention", with = "humantime_serde")]
    pub aggregate_retention: Duration,

    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Live-window entries older than this are evicted by the sweeper
    #[serde(default = "default_live_window_max_age", with = "humantime_serde")]
    pub live_window_max_age: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            raw_retention: default_raw_retention(),
            aggregate_retention: default_aggregate_retention(),
            sweep_interval: default_sweep_interval(),
            live_window_max_age: default_live_window_max_age(),
        }
    }
}

fn default_raw_retention() -> Duration {
    Duration::from_secs(RAW_RETENTION_SECS)
}

fn default_aggregate_retention() -> Duration {
    Duration::from_secs(AGGREGATE_RETENTION_SECS)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(SWEEP_INTERVAL_SECS)
}

fn default_live_window_max_age() -> Duration {
    Duration::from_secs(LIVE_WINDOW_MAX_AGE_SECS)
}

// ----------------------------------------------------------------------------
// Buffers
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Points kept per (service, metric type)
    #[serde(default = "default_buffer_capacity")]
    pub capacity: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: default_buffer_capacity(),
        }
    }
}

fn default_buffer_capacity() -> usize {
    DEFAULT_WINDOW_CAPACITY
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertsConfig {
    #[serde(default = "default_alert_capacity")]
    pub capacity: usize,

    /// Alerts returned when a caller gives no limit
    #[serde(default = "default_alert_limit")]
    pub default_limit: usize,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            capacity: default_alert_capacity(),
            default_limit: default_alert_limit(),
        }
    }
}

fn default_alert_capacity() -> usize {
    DEFAULT_ALERT_CAPACITY
}

fn default_alert_limit() -> usize {
    DEFAULT_ALERT_LIMIT
}

// ----------------------------------------------------------------------------
// Thresholds
// ----------------------------------------------------------------------------

/// Warning and critical levels for one metric type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdLevels {
    pub warning: f64,
    pub critical: f64,
}

impl ThresholdLevels {
    pub const fn new(warning: f64, critical: f64) -> Self {
        Self { warning, critical }
    }
}

/// Per-metric-type thresholds. The comparison direction is fixed by type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdsConfig {
    #[serde(default = "default_latency_thresholds")]
    pub latency: ThresholdLevels,

    #[serde(default = "default_error_rate_thresholds")]
    pub error_rate: ThresholdLevels,

    #[serde(default = "default_cpu_thresholds")]
    pub cpu: ThresholdLevels,

    #[serde(default = "default_memory_thresholds")]
    pub memory: ThresholdLevels,

    #[serde(default = "default_throughput_thresholds")]
    pub throughput: ThresholdLevels,
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        Self {
            latency: default_latency_thresholds(),
            error_rate: default_error_rate_thresholds(),
            cpu: default_cpu_thresholds(),
            memory: default_memory_thresholds(),
            throughput: default_throughput_thresholds(),
        }
    }
}

impl ThresholdsConfig {
    pub fn levels(&self, metric_type: MetricType) -> ThresholdLevels {
        match metric_type {
            MetricType::Latency => self.latency,
            MetricType::ErrorRate => self.error_rate,
            MetricType::Cpu => self.cpu,
            MetricType::Memory => self.memory,
            MetricType::Throughput => self.throughput,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for metric_type in MetricType::ALL {
            let levels = self.levels(metric_type);
            let field = format!("thresholds.{metric_type}");

            for (name, value) in [("warning", levels.warning), ("critical", levels.critical)] {
                if !value.is_finite() || value < 0.0 {
                    return Err(ConfigError::invalid_value(
                        format!("{field}.{name}"),
                        format!("threshold must be a finite non-negative number, got {value}"),
                    ));
                }
            }

            let ordered = match Comparison::for_metric(metric_type) {
                Comparison::Above => levels.warning < levels.critical,
                Comparison::Below => levels.critical < levels.warning,
            };
            if !ordered {
                return Err(ConfigError::invalid_value(
                    field,
                    format!(
                        "warning ({}) and critical ({}) are ordered against the {} comparison",
                        levels.warning,
                        levels.critical,
                        Comparison::for_metric(metric_type).as_str()
                    ),
                ));
            }
        }
        Ok(())
    }
}

fn default_latency_thresholds() -> ThresholdLevels {
    ThresholdLevels::new(500.0, 1000.0)
}

fn default_error_rate_thresholds() -> ThresholdLevels {
    ThresholdLevels::new(0.05, 0.10)
}

fn default_cpu_thresholds() -> ThresholdLevels {
    ThresholdLevels::new(80.0, 95.0)
}

fn default_memory_thresholds() -> ThresholdLevels {
    ThresholdLevels::new(80.0, 95.0)
}

fn default_throughput_thresholds() -> ThresholdLevels {
    ThresholdLevels::new(100.0, 50.0)
}

// ----------------------------------------------------------------------------
// Broadcast Hub
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubConfig {
    /// Pending events per subscriber before it is dropped
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Historical points sent in the initial snapshot
    #[serde(default = "default_initial_snapshot_size")]
    pub initial_snapshot_size: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            initial_snapshot_size: default_initial_snapshot_size(),
        }
    }
}

fn default_queue_capacity() -> usize {
    DEFAULT_SUBSCRIBER_QUEUE
}

fn default_initial_snapshot_size() -> usize {
    INITIAL_SNAPSHOT_SIZE
}

// ----------------------------------------------------------------------------
// Storage
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Volatile, lost on restart
    #[default]
    Memory,
    /// Append-only log replayed on startup
    Wal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Upper bound on a raw query result
    #[serde(default = "default_raw_query_limit")]
    pub raw_query_limit: usize,

    /// fsync after every append instead of on shutdown and sweeps
    #[serde(default)]
    pub sync_every_write: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            data_dir: default_data_dir(),
            raw_query_limit: default_raw_query_limit(),
            sync_every_write: false,
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_raw_query_limit() -> usize {
    RAW_QUERY_LIMIT
}

// ----------------------------------------------------------------------------
// Rollup
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollupConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_rollup_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// How far back completed buckets are (re)computed on each run
    #[serde(default = "default_rollup_lookback", with = "humantime_serde")]
    pub lookback: Duration,
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_rollup_interval(),
            lookback: default_rollup_lookback(),
        }
    }
}

fn default_rollup_interval() -> Duration {
    Duration::from_secs(ROLLUP_INTERVAL_SECS)
}

fn default_rollup_lookback() -> Duration {
    Duration::from_secs(ROLLUP_LOOKBACK_SECS)
}

// ----------------------------------------------------------------------------
// HTTP / WebSocket Server
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Allow any origin (dashboard served from another host)
    #[serde(default = "default_true")]
    pub cors_permissive: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            cors_permissive: true,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind_addr
            .parse()
            .map_err(|e| ConfigError::invalid_value("server.bind_addr", format!("{e}")))
    }
}

fn default_bind_addr() -> String {
    DEFAULT_HTTP_ADDR.into()
}

// ----------------------------------------------------------------------------
// Synthetic Producer
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_simulator_interval", with = "humantime_serde")]
    pub interval: Duration,

    #[serde(default = "default_simulator_services")]
    pub services: Vec<String>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_simulator_interval(),
            services: default_simulator_services(),
        }
    }
}

fn default_simulator_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_simulator_services() -> Vec<String> {
    ["auth", "api", "database", "cache", "queue"]
        .into_iter()
        .map(String::from)
        .collect()
}

// ----------------------------------------------------------------------------
// Logging
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

fn default_true() -> bool {
    true
}
