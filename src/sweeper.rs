// ============================================================================
// RETENTION SWEEPER
// ============================================================================
// Periodic retention enforcement.
//
// Each pass purges raw points older than the raw retention (cutoff floored
// to the hour, so no 1m/5m/1h bucket is ever left half-purged), persisted
// rollups older than the aggregate retention, and live-window samples older
// than the live-window age limit. A failed pass is logged and retried on the
// next tick.
// ============================================================================

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::RetentionConfig;
use crate::error::StorageResult;
use crate::store::MetricStore;
use crate::telemetry::EngineMetrics;
use crate::types::{AggregationInterval, Timestamp};
use crate::window::LiveWindow;

/// Counts removed by one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub points_purged: usize,
    pub buckets_purged: usize,
    pub window_evicted: usize,
}

pub struct RetentionSweeper {
    store: Arc<dyn MetricStore>,
    window: Arc<LiveWindow>,
    retention: RetentionConfig,
    metrics: EngineMetrics,
}

impl RetentionSweeper {
    pub fn new(
        store: Arc<dyn MetricStore>,
        window: Arc<LiveWindow>,
        retention: RetentionConfig,
        metrics: EngineMetrics,
    ) -> Self {
        Self {
            store,
            window,
            retention,
            metrics,
        }
    }

    /// Raw cutoff for a sweep at `now`
    pub fn raw_cutoff(&self, now: Timestamp) -> Timestamp {
        AggregationInterval::LARGEST.bucket_start(now.sub_duration(self.retention.raw_retention))
    }

    pub async fn sweep(&self, now: Timestamp) -> StorageResult<SweepReport> {
        let raw_cutoff = self.raw_cutoff(now);
        let points_purged = self.store.purge_older_than(raw_cutoff).await?;
        self.metrics.points_purged.inc_by(points_purged as u64);

        let bucket_cutoff = now.sub_duration(self.retention.aggregate_retention);
        let buckets_purged = self.store.purge_buckets_older_than(bucket_cutoff).await?;

        let window_evicted = self
            .window
            .evict_older_than(now.sub_duration(self.retention.live_window_max_age));

        if points_purged > 0 || buckets_purged > 0 {
            self.store.sync().await?;
        }

        Ok(SweepReport {
            points_purged,
            buckets_purged,
            window_evicted,
        })
    }

    pub async fn run(self, token: CancellationToken) {
        info!(
            target: "pulse::sweeper",
            interval = ?self.retention.sweep_interval,
            raw_retention = ?self.retention.raw_retention,
            aggregate_retention = ?self.retention.aggregate_retention,
            "Retention sweeper started"
        );

        let start = tokio::time::Instant::now() + self.retention.sweep_interval;
        let mut ticker = tokio::time::interval_at(start, self.retention.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    match self.sweep(Timestamp::now()).await {
                        Ok(report) => info!(
                            target: "pulse::sweeper",
                            points = report.points_purged,
                            buckets = report.buckets_purged,
                            window = report.window_evicted,
                            "Retention sweep complete"
                        ),
                        Err(e) => {
                            self.metrics.storage_errors.inc();
                            error!(target: "pulse::sweeper", error = %e, "Retention sweep failed, will retry");
                        }
                    }
                }
            }
        }
        info!(target: "pulse::sweeper", "Retention sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::store::{execute_query, MemoryStore};
    use crate::types::{Aggregation, MetricPoint, MetricQuery, MetricType, QueryResult};

    const HOUR: i64 = 3600;

    fn at(secs: i64) -> MetricPoint {
        MetricPoint::new("auth", MetricType::Latency, 1.0).with_timestamp(Timestamp::from_secs(secs))
    }

    fn sweeper(store: Arc<MemoryStore>, window: Arc<LiveWindow>) -> RetentionSweeper {
        RetentionSweeper::new(
            store,
            window,
            RetentionConfig::default(),
            EngineMetrics::new().unwrap(),
        )
    }

    #[tokio::test]
    async fn test_retention_scenario() {
        let store = Arc::new(MemoryStore::new());
        let now = Timestamp::from_secs(100 * HOUR);
        let old = now.sub_duration(Duration::from_secs(25 * 3600));
        store.insert(&at(old.as_secs())).await.unwrap();
        store.insert(&at(now.as_secs() - 60)).await.unwrap();

        let sweeper = sweeper(store.clone(), Arc::new(LiveWindow::default()));
        let report = sweeper.sweep(now).await.unwrap();
        assert_eq!(report.points_purged, 1);

        let query = MetricQuery::range(Timestamp::from_secs(0), now);
        let QueryResult::Points(points) = execute_query(store.as_ref(), &query, 10_000).await.unwrap() else {
            panic!("expected raw points");
        };
        assert_eq!(points.len(), 1);
        assert!(points.iter().all(|p| p.timestamp != old));
    }

    #[tokio::test]
    async fn test_cutoff_is_hour_aligned() {
        let store = Arc::new(MemoryStore::new());
        let now = Timestamp::from_secs(100 * HOUR + 1800);
        let sweeper = sweeper(store.clone(), Arc::new(LiveWindow::default()));
        assert_eq!(sweeper.raw_cutoff(now), Timestamp::from_secs(76 * HOUR));

        // 24.25h old but in the same hour as the cutoff: kept until the hour closes.
        store.insert(&at(76 * HOUR + 900)).await.unwrap();
        store.insert(&at(76 * HOUR - 1)).await.unwrap();
        assert_eq!(sweeper.sweep(now).await.unwrap().points_purged, 1);

        let query = MetricQuery::range(Timestamp::from_secs(0), now)
            .with_aggregation(Aggregation::Bucketed(AggregationInterval::OneHour));
        let QueryResult::Buckets(buckets) = execute_query(store.as_ref(), &query, 10_000).await.unwrap() else {
            panic!("expected buckets");
        };
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].count, 1);
    }

    #[tokio::test]
    async fn test_sweep_is_idempotent_and_evicts_window() {
        let store = Arc::new(MemoryStore::new());
        let window = Arc::new(LiveWindow::default());
        let now = Timestamp::from_secs(100 * HOUR);
        window.push(&at(now.as_secs() - 2 * HOUR));
        window.push(&at(now.as_secs() - 60));

        let sweeper = sweeper(store, window.clone());
        let first = sweeper.sweep(now).await.unwrap();
        assert_eq!(first.window_evicted, 1);
        assert_eq!(sweeper.sweep(now).await.unwrap(), SweepReport::default());
        assert_eq!(window.len("auth", MetricType::Latency), 1);
    }

    #[tokio::test]
    async fn test_old_rollups_purged() {
        let store = Arc::new(MemoryStore::new());
        let now = Timestamp::from_secs(1000 * HOUR);
        let ancient = crate::aggregator::aggregate(
            &[at(now.as_secs() - 8 * 24 * HOUR), at(now.as_secs() - 2 * HOUR)],
            AggregationInterval::OneHour,
        );
        store.upsert_buckets(&ancient).await.unwrap();

        let sweeper = sweeper(store.clone(), Arc::new(LiveWindow::default()));
        assert_eq!(sweeper.sweep(now).await.unwrap().buckets_purged, 1);
        assert_eq!(store.bucket_count(), 1);
    }

    #[tokio::test]
    async fn test_very_long_retention_keeps_fresh_points() {
        let store = Arc::new(MemoryStore::new());
        let now = Timestamp::from_secs(500_000 * HOUR);
        store.insert(&at(now.as_secs())).await.unwrap();

        let centuries = Duration::from_secs(300 * 365 * 24 * 3600);
        let mut retention = RetentionConfig::default();
        retention.raw_retention = centuries;
        retention.aggregate_retention = centuries;
        let sweeper = RetentionSweeper::new(
            store.clone(),
            Arc::new(LiveWindow::default()),
            retention,
            EngineMetrics::new().unwrap(),
        );

        assert!(sweeper.raw_cutoff(now) < now);
        assert_eq!(sweeper.sweep(now).await.unwrap().points_purged, 0);
        assert_eq!(store.point_count(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let store = Arc::new(MemoryStore::new());
        let mut retention = RetentionConfig::default();
        retention.sweep_interval = Duration::from_millis(10);
        let sweeper = RetentionSweeper::new(
            store,
            Arc::new(LiveWindow::default()),
            retention,
            EngineMetrics::new().unwrap(),
        );
        let token = CancellationToken::new();
        let handle = tokio::spawn(sweeper.run(token.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
