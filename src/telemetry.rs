// ============================================================================
// SELF-TELEMETRY
// ============================================================================
// Self-telemetry exported in Prometheus text format.
//
// The registry is owned by the engine rather than being process-global, so
// several engines (and tests) can live in one process.
// ============================================================================

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

use crate::hub::DropReason;
use crate::types::Severity;

/// Counters and gauges describing the engine's own behaviour
#[derive(Clone)]
pub struct EngineMetrics {
    registry: Registry,

    /// Points accepted by the pipeline
    pub points_ingested: IntCounter,

    /// Points rejected by validation
    pub points_rejected: IntCounter,

    /// Alerts raised, by severity
    pub alerts: IntCounterVec,

    /// Currently registered subscribers
    pub subscribers_active: IntGauge,

    /// Subscribers removed by the hub, by reason
    pub subscribers_dropped: IntCounterVec,

    /// Raw points removed by the retention sweeper
    pub points_purged: IntCounter,

    /// Failed store operations
    pub storage_errors: IntCounter,

    /// Wall time of one ingest call
    pub ingest_duration: Histogram,
}

impl EngineMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let points_ingested = IntCounter::new(
            "pulse_points_ingested_total",
            "Total metric points accepted",
        )?;
        registry.register(Box::new(points_ingested.clone()))?;

        let points_rejected = IntCounter::new(
            "pulse_points_rejected_total",
            "Total metric points rejected by validation",
        )?;
        registry.register(Box::new(points_rejected.clone()))?;

        let alerts = IntCounterVec::new(
            Opts::new("pulse_alerts_total", "Total alerts raised"),
            &["severity"],
        )?;
        registry.register(Box::new(alerts.clone()))?;

        let subscribers_active = IntGauge::new(
            "pulse_subscribers_active",
            "Streaming subscribers currently registered",
        )?;
        registry.register(Box::new(subscribers_active.clone()))?;

        let subscribers_dropped = IntCounterVec::new(
            Opts::new(
                "pulse_subscribers_dropped_total",
                "Subscribers removed by the broadcast hub",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(subscribers_dropped.clone()))?;

        let points_purged = IntCounter::new(
            "pulse_points_purged_total",
            "Raw points removed by retention",
        )?;
        registry.register(Box::new(points_purged.clone()))?;

        let storage_errors = IntCounter::new(
            "pulse_storage_errors_total",
            "Failed store operations",
        )?;
        registry.register(Box::new(storage_errors.clone()))?;

        let ingest_duration = Histogram::with_opts(
            HistogramOpts::new(
                "pulse_ingest_duration_seconds",
                "Time spent in one ingest call",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5]),
        )?;
        registry.register(Box::new(ingest_duration.clone()))?;

        Ok(Self {
            registry,
            points_ingested,
            points_rejected,
            alerts,
            subscribers_active,
            subscribers_dropped,
            points_purged,
            storage_errors,
            ingest_duration,
        })
    }

    pub fn record_alert(&self, severity: Severity) {
        self.alerts.with_label_values(&[severity.as_str()]).inc();
    }

    pub fn record_drop(&self, reason: DropReason) {
        self.subscribers_dropped
            .with_label_values(&[reason.as_str()])
            .inc();
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Export in Prometheus text format
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
