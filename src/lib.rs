//! # Pulse Engine - Live Telemetry for Service Dashboards
//!
//! Ingests metric points from simulated (or real) services, keeps them in a
//! durable time-indexed store and a bounded in-memory live window, raises
//! threshold alerts, computes bucketed percentile summaries and fans every
//! event out to connected streaming subscribers.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              PULSE ENGINE                                    │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  PRODUCER → PIPELINE → STORE / LIVE WINDOW → DETECTOR → HUB → SUBSCRIBERS    │
//! │                  ↑                                                          │
//! │          QUERY → STORE / AGGREGATOR          SWEEPER → STORE / WINDOW       │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Bounded live window**: FIFO-1000 per (service, metric type), per-key locking
//! - **Threshold alerts**: warning/critical levels, inverted comparison for throughput
//! - **Nearest-rank percentiles**: deterministic 1m/5m/1h bucket summaries
//! - **Fan-out with backpressure**: slow subscribers are dropped, never waited on
//! - **Retention**: raw points and persisted rollups expire independently

pub mod aggregator;
pub mod alerts;
pub mod client;
pub mod config;
pub mod detector;
pub mod engine;
pub mod error;
pub mod hub;
pub mod logging;
pub mod pipeline;
pub mod server;
pub mod simulator;
pub mod store;
pub mod sweeper;
pub mod telemetry;
pub mod types;
pub mod window;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{PulseError, PulseResult};
pub use pipeline::{IngestOutcome, IngestPipeline};
pub use types::{
    AggregatedBucket, Aggregation, AggregationInterval, Alert, HealthStatus, MetricPoint,
    MetricQuery, MetricType, ServiceHealth, Severity, StreamEvent, Timestamp,
};

// ============================================================================
// CONSTANTS & VERSION INFORMATION
// ============================================================================

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "pulse-engine";
pub const ENGINE_FULL_NAME: &str = "Pulse Telemetry Engine";

// ----------------------------------------------------------------------------
// Buffers & Queues
// ----------------------------------------------------------------------------

/// Points kept per (service, metric type) in the live window
pub const DEFAULT_WINDOW_CAPACITY: usize = 1000;

/// Most-recent alerts retained in memory
pub const DEFAULT_ALERT_CAPACITY: usize = 100;

/// Alerts returned when the caller gives no limit
pub const DEFAULT_ALERT_LIMIT: usize = 10;

/// Pending events per subscriber before it is dropped
pub const DEFAULT_SUBSCRIBER_QUEUE: usize = 1000;

/// Historical points sent to a new subscriber
pub const INITIAL_SNAPSHOT_SIZE: usize = 50;

/// Upper bound on a raw query result
pub const RAW_QUERY_LIMIT: usize = 10_000;

// ----------------------------------------------------------------------------
// Retention & Scheduling
// ----------------------------------------------------------------------------

pub const RAW_RETENTION_SECS: u64 = 24 * 3600;
pub const AGGREGATE_RETENTION_SECS: u64 = 7 * 24 * 3600;
pub const SWEEP_INTERVAL_SECS: u64 = 300;
pub const LIVE_WINDOW_MAX_AGE_SECS: u64 = 3600;
pub const ROLLUP_INTERVAL_SECS: u64 = 60;
pub const ROLLUP_LOOKBACK_SECS: u64 = 2 * 3600;

/// Upper bound for any configured retention, age or schedule duration
pub const MAX_CONFIG_DURATION_SECS: u64 = 10 * 365 * 24 * 3600;

// ----------------------------------------------------------------------------
// Validation Limits
// ----------------------------------------------------------------------------

pub const MAX_SERVICE_NAME_LENGTH: usize = 256;
pub const MAX_TAGS_PER_POINT: usize = 32;
pub const MAX_TAG_KEY_LENGTH: usize = 128;

// ----------------------------------------------------------------------------
// Network
// ----------------------------------------------------------------------------

pub const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:8000";
pub const DEFAULT_STREAM_URL: &str = "ws://127.0.0.1:8000/ws/metrics";
pub const RECONNECT_INITIAL_DELAY_SECS: u64 = 1;
pub const RECONNECT_MAX_DELAY_SECS: u64 = 30;
