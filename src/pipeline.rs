// ============================================================================
// INGESTION PIPELINE
// ============================================================================
// validate → persist → live window → detect → alert log → broadcast
//
// Validation happens before any side effect. A storage failure aborts the
// call before the point reaches the window or the hub. For every point the
// `metric` event is published before its `alert` event.
//
// There is no pipeline-wide lock: the store, the window (per series), the
// alert log and the hub each guard their own state.
// ============================================================================

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{error, instrument, trace, warn};

use crate::alerts::AlertLog;
use crate::config::EngineConfig;
use crate::detector::AnomalyDetector;
use crate::error::{PulseError, PulseResult, StorageError};
use crate::hub::{BroadcastHub, Subscription};
use crate::store::{execute_query, MetricStore};
use crate::telemetry::EngineMetrics;
use crate::types::{Alert, MetricPoint, MetricQuery, QueryResult, ServiceHealth, StreamEvent};
use crate::window::LiveWindow;

/// Result of a successful ingest
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestOutcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert: Option<Alert>,
}

pub struct IngestPipeline {
    store: Arc<dyn MetricStore>,
    window: Arc<LiveWindow>,
    detector: AnomalyDetector,
    alerts: Arc<AlertLog>,
    hub: Arc<BroadcastHub>,
    metrics: EngineMetrics,
    raw_query_limit: usize,
    snapshot_size: usize,
    default_alert_limit: usize,
}

impl IngestPipeline {
    pub fn new(config: &EngineConfig, store: Arc<dyn MetricStore>, metrics: EngineMetrics) -> Self {
        Self {
            store,
            window: Arc::new(LiveWindow::new(config.buffer.capacity)),
            detector: AnomalyDetector::new(&config.thresholds),
            alerts: Arc::new(AlertLog::new(config.alerts.capacity)),
            hub: Arc::new(BroadcastHub::new(config.hub.queue_capacity, metrics.clone())),
            metrics,
            raw_query_limit: config.storage.raw_query_limit,
            snapshot_size: config.hub.initial_snapshot_size,
            default_alert_limit: config.alerts.default_limit,
        }
    }

    pub fn store(&self) -> &Arc<dyn MetricStore> {
        &self.store
    }

    pub fn window(&self) -> &Arc<LiveWindow> {
        &self.window
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    pub fn alerts(&self) -> &Arc<AlertLog> {
        &self.alerts
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    fn storage_failure(&self, operation: &'static str, e: StorageError) -> PulseError {
        self.metrics.storage_errors.inc();
        error!(target: "pulse::pipeline", operation, error = %e, "Store operation failed");
        PulseError::Storage(e)
    }

    /// Ingest one point.
    #[instrument(
        level = "trace",
        target = "pulse::pipeline",
        skip_all,
        fields(service = %point.service, metric_type = %point.metric_type)
    )]
    pub async fn ingest(&self, point: MetricPoint) -> PulseResult<IngestOutcome> {
        let started = Instant::now();
        if let Err(e) = point.validate() {
            self.metrics.points_rejected.inc();
            return Err(e.into());
        }

        self.store
            .insert(&point)
            .await
            .map_err(|e| self.storage_failure("insert", e))?;

        let alert = self.process(point);
        self.metrics.points_ingested.inc();
        self.metrics
            .ingest_duration
            .observe(started.elapsed().as_secs_f64());
        Ok(IngestOutcome { alert })
    }

    /// Ingest a batch. Every point is validated before anything is written;
    /// the batch is persisted with one store call.
    #[instrument(level = "trace", target = "pulse::pipeline", skip_all, fields(points = points.len()))]
    pub async fn ingest_batch(&self, points: Vec<MetricPoint>) -> PulseResult<Vec<Alert>> {
        let started = Instant::now();
        for point in &points {
            if let Err(e) = point.validate() {
                self.metrics.points_rejected.inc_by(points.len() as u64);
                return Err(e.into());
            }
        }
        if points.is_empty() {
            return Ok(Vec::new());
        }

        self.store
            .insert_batch(&points)
            .await
            .map_err(|e| self.storage_failure("insert_batch", e))?;

        let count = points.len() as u64;
        let alerts: Vec<Alert> = points.into_iter().filter_map(|p| self.process(p)).collect();
        self.metrics.points_ingested.inc_by(count);
        self.metrics
            .ingest_duration
            .observe(started.elapsed().as_secs_f64());
        Ok(alerts)
    }

    /// Post-persistence steps for one point
    fn process(&self, point: MetricPoint) -> Option<Alert> {
        self.window.push(&point);
        let alert = self.detector.detect(&point);

        if let Some(alert) = &alert {
            self.alerts.push(alert.clone());
            self.metrics.record_alert(alert.severity);
            warn!(
                target: "pulse::alerts",
                service = %alert.service,
                metric_type = %alert.metric_type,
                severity = %alert.severity,
                value = alert.value,
                threshold = alert.threshold,
                "{}",
                alert.message
            );
        }

        trace!(
            target: "pulse::pipeline",
            service = %point.service,
            metric_type = %point.metric_type,
            value = point.value,
            "Point ingested"
        );
        self.hub.publish(StreamEvent::Metric(point));
        if let Some(alert) = &alert {
            self.hub.publish(StreamEvent::Alert(alert.clone()));
        }
        alert
    }

    #[instrument(level = "debug", target = "pulse::pipeline", skip_all, fields(aggregation = query.aggregation.as_str()))]
    pub async fn query(&self, query: &MetricQuery) -> PulseResult<QueryResult> {
        query.validate()?;
        execute_query(self.store.as_ref(), query, self.raw_query_limit)
            .await
            .map_err(|e| self.storage_failure("query", e))
    }

    pub async fn list_services(&self) -> PulseResult<Vec<String>> {
        self.store
            .list_services()
            .await
            .map_err(|e| self.storage_failure("list_services", e))
    }

    /// Health of every stored service, from the live window
    pub async fn services(&self) -> PulseResult<Vec<ServiceHealth>> {
        let services = self.list_services().await?;
        Ok(services
            .into_iter()
            .map(|service| {
                let metrics = self.window.service_summaries(&service);
                let status = self.detector.health_status(&metrics);
                ServiceHealth {
                    service,
                    status,
                    metrics,
                }
            })
            .collect())
    }

    /// Newest alerts first
    pub fn recent_alerts(&self, limit: Option<usize>) -> Vec<Alert> {
        self.alerts.recent(limit.unwrap_or(self.default_alert_limit))
    }

    /// Register a subscriber and queue its initial snapshot (oldest first).
    ///
    /// The subscriber is registered before the store is read, so every
    /// point ingested after the read is delivered live.
    pub async fn subscribe(&self) -> PulseResult<Subscription> {
        let pending = self.hub.begin_subscribe();
        let mut snapshot = self
            .store
            .latest(self.snapshot_size)
            .await
            .map_err(|e| self.storage_failure("latest", e))?;
        snapshot.reverse();
        Ok(pending.activate(snapshot))
    }
}
