// ============================================================================
// AGGREGATION
// ============================================================================
// Time-bucketed summaries with nearest-rank percentiles.
//
// Values are sorted before any statistic is taken (including the sum), so the
// output depends only on the multiset of input points, never on their order.
// ============================================================================

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use compact_str::CompactString;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::MetricStore;
use crate::types::{
    AggregatedBucket, AggregationInterval, BucketKey, MetricPoint, MetricQuery, MetricType,
    Timestamp,
};
use crate::error::StorageResult;

// ----------------------------------------------------------------------------
// Statistical Functions
// ----------------------------------------------------------------------------

/// Nearest-rank percentile over ascending `sorted` values: the element at
/// index `floor(fraction * n)`, clamped to the last element.
pub fn percentile(sorted: &[f64], fraction: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let n = sorted.len();
    let idx = ((fraction * n as f64).floor() as usize).min(n - 1);
    Some(sorted[idx])
}

/// Summary of one group of values
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stats {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub count: u64,
}

/// Order-independent statistics; `None` for an empty slice
pub fn summarize(values: &[f64]) -> Option<Stats> {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    summarize_sorted(&sorted)
}

fn summarize_sorted(sorted: &[f64]) -> Option<Stats> {
    let min = *sorted.first()?;
    let max = *sorted.last()?;
    let count = sorted.len();
    let sum: f64 = sorted.iter().sum();
    Some(Stats {
        p50: percentile(sorted, 0.50)?,
        p95: percentile(sorted, 0.95)?,
        p99: percentile(sorted, 0.99)?,
        min,
        max,
        avg: sum / count as f64,
        count: count as u64,
    })
}

// ----------------------------------------------------------------------------
// Bucketing
// ----------------------------------------------------------------------------

/// Group by `(floor(timestamp, interval), service, metric_type)` and summarize
/// each non-empty group. Output is ordered by bucket start, then service,
/// then metric type.
pub fn aggregate(points: &[MetricPoint], interval: AggregationInterval) -> Vec<AggregatedBucket> {
    let mut groups: BTreeMap<(Timestamp, CompactString, MetricType), Vec<f64>> = BTreeMap::new();
    for point in points {
        groups
            .entry((
                interval.bucket_start(point.timestamp),
                point.service.clone(),
                point.metric_type,
            ))
            .or_default()
            .push(point.value);
    }

    groups
        .into_iter()
        .filter_map(|((bucket_start, service, metric_type), values)| {
            let stats = summarize(&values)?;
            Some(AggregatedBucket {
                bucket_start,
                service,
                metric_type,
                interval,
                p50: stats.p50,
                p95: stats.p95,
                p99: stats.p99,
                min: stats.min,
                max: stats.max,
                avg: stats.avg,
                count: stats.count,
            })
        })
        .collect()
}

/// Merge persisted rollups into freshly computed buckets.
///
/// A persisted bucket is used only when no computed bucket has its key and
/// its whole span lies inside the query range; any raw point it summarized
/// would then have been seen by the query.
pub fn merge_persisted(
    computed: Vec<AggregatedBucket>,
    persisted: Vec<AggregatedBucket>,
    query: &MetricQuery,
) -> Vec<AggregatedBucket> {
    if persisted.is_empty() {
        return computed;
    }
    let known: BTreeSet<BucketKey> = computed.iter().map(AggregatedBucket::key).collect();
    let mut merged = computed;
    merged.extend(persisted.into_iter().filter(|b| {
        !known.contains(&b.key())
            && b.bucket_start >= query.start_time
            && b.bucket_end() <= query.end_time
    }));
    merged.sort_by(|a, b| {
        (a.bucket_start, &a.service, a.metric_type).cmp(&(b.bucket_start, &b.service, b.metric_type))
    });
    merged
}

// ----------------------------------------------------------------------------
// Scheduled Rollup
// ----------------------------------------------------------------------------

/// Periodically persists buckets for completed intervals so summaries
/// outlive raw retention.
pub struct RollupScheduler {
    store: Arc<dyn MetricStore>,
    interval: Duration,
    lookback: Duration,
}

impl RollupScheduler {
    pub fn new(store: Arc<dyn MetricStore>, interval: Duration, lookback: Duration) -> Self {
        Self {
            store,
            interval,
            lookback,
        }
    }

    /// Roll up every completed bucket in `[now - lookback, now)`.
    /// Returns the number of buckets written.
    pub async fn run_once(&self, now: Timestamp) -> StorageResult<usize> {
        let mut written = 0;
        for interval in AggregationInterval::ALL {
            let end = interval.bucket_start(now);
            let start = interval.bucket_start(now.sub_duration(self.lookback));
            if end <= start {
                continue;
            }
            let query = MetricQuery::range(start, Timestamp::from_nanos(end.as_nanos() - 1));
            let points = self.store.scan(&query, None).await?;
            let buckets = aggregate(&points, interval);
            if !buckets.is_empty() {
                written += self.store.upsert_buckets(&buckets).await?;
            }
            debug!(
                target: "pulse::rollup",
                interval = %interval,
                points = points.len(),
                buckets = buckets.len(),
                "Rollup pass"
            );
        }
        Ok(written)
    }

    pub async fn run(self, token: CancellationToken) {
        info!(
            target: "pulse::rollup",
            interval = ?self.interval,
            lookback = ?self.lookback,
            "Rollup scheduler started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    match self.run_once(Timestamp::now()).await {
                        Ok(written) => debug!(target: "pulse::rollup", written, "Rollup complete"),
                        Err(e) => warn!(target: "pulse::rollup", error = %e, "Rollup failed, will retry"),
                    }
                }
            }
        }
        info!(target: "pulse::rollup", "Rollup scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::types::Aggregation;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn at(secs: i64, service: &str, metric_type: MetricType, value: f64) -> MetricPoint {
        MetricPoint::new(service, metric_type, value).with_timestamp(Timestamp::from_secs(secs))
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let sorted: Vec<f64> = (1..=60).map(f64::from).collect();
        assert_eq!(percentile(&sorted, 0.50), Some(31.0));
        assert_eq!(percentile(&sorted, 0.95), Some(58.0));
        assert_eq!(percentile(&sorted, 0.99), Some(60.0));
        assert_eq!(percentile(&[7.0], 0.99), Some(7.0));
        assert_eq!(percentile(&[], 0.5), None);
    }

    #[test]
    fn test_one_minute_bucket() {
        let base = 1_700_000_040;
        let points: Vec<_> = (0..60)
            .map(|i| at(base + i, "auth", MetricType::Latency, (i + 1) as f64))
            .collect();

        let buckets = aggregate(&points, AggregationInterval::OneMinute);
        assert_eq!(buckets.len(), 1);
        let bucket = &buckets[0];
        assert_eq!(bucket.bucket_start, Timestamp::from_secs(base));
        assert_eq!(bucket.count, 60);
        assert_eq!(bucket.p50, 31.0);
        assert_eq!(bucket.min, 1.0);
        assert_eq!(bucket.max, 60.0);
        assert_eq!(bucket.avg, 30.5);
    }

    #[test]
    fn test_grouping_by_bucket_service_and_type() {
        let points = vec![
            at(0, "auth", MetricType::Latency, 1.0),
            at(30, "auth", MetricType::Latency, 2.0),
            at(61, "auth", MetricType::Latency, 3.0),
            at(10, "api", MetricType::Latency, 4.0),
            at(10, "auth", MetricType::Cpu, 5.0),
        ];
        let buckets = aggregate(&points, AggregationInterval::OneMinute);
        assert_eq!(buckets.len(), 4);
        assert!(buckets.windows(2).all(|w| w[0].bucket_start <= w[1].bucket_start));
        assert_eq!(buckets.iter().map(|b| b.count).sum::<u64>(), 5);

        let hourly = aggregate(&points, AggregationInterval::OneHour);
        assert_eq!(hourly.len(), 3);
        assert!(aggregate(&[], AggregationInterval::OneHour).is_empty());
    }

    #[test]
    fn test_merge_prefers_computed() {
        let query = MetricQuery::range(Timestamp::from_secs(0), Timestamp::from_secs(600));
        let computed = aggregate(&[at(60, "auth", MetricType::Cpu, 10.0)], AggregationInterval::OneMinute);

        let mut stale = computed[0].clone();
        stale.avg = 99.0;
        let mut archived = computed[0].clone();
        archived.bucket_start = Timestamp::from_secs(0);
        let mut partial = computed[0].clone();
        partial.bucket_start = Timestamp::from_secs(600);

        let merged = merge_persisted(computed.clone(), vec![stale, archived.clone(), partial], &query);
        assert_eq!(merged, vec![archived, computed[0].clone()]);
    }

    #[tokio::test]
    async fn test_rollup_persists_completed_buckets() {
        let store = Arc::new(MemoryStore::new());
        let now = Timestamp::from_secs(7_200 + 90);
        let points: Vec<_> = (0..5)
            .map(|i| at(7_200 + i * 10, "api", MetricType::Latency, i as f64))
            .collect();
        store.insert_batch(&points).await.unwrap();

        let scheduler = RollupScheduler::new(store.clone(), Duration::from_secs(60), Duration::from_secs(3600));
        let written = scheduler.run_once(now).await.unwrap();
        assert_eq!(written, 1);

        let query = MetricQuery::range(Timestamp::from_secs(0), now)
            .with_aggregation(Aggregation::Bucketed(AggregationInterval::OneMinute));
        let stored = store
            .scan_buckets(AggregationInterval::OneMinute, &query)
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].count, 5);
    }

    proptest! {
        #[test]
        fn prop_aggregation_order_independent(
            values in prop::collection::vec((0i64..600, -1e3f64..1e3), 1..200),
            seed in any::<u64>(),
        ) {
            let points: Vec<_> = values
                .iter()
                .map(|(s, v)| at(*s, "svc", MetricType::Latency, *v))
                .collect();
            let mut shuffled = points.clone();
            let len = shuffled.len();
            let mut state = seed;
            for i in (1..len).rev() {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                shuffled.swap(i, (state >> 33) as usize % (i + 1));
            }

            let a = aggregate(&points, AggregationInterval::FiveMinutes);
            let b = aggregate(&shuffled, AggregationInterval::FiveMinutes);
            prop_assert_eq!(a, b);
        }

        #[test]
        fn prop_counts_match_bucket_membership(
            secs in prop::collection::vec(0i64..7200, 1..300),
        ) {
            let points: Vec<_> = secs.iter().map(|s| at(*s, "svc", MetricType::Cpu, 1.0)).collect();
            for bucket in aggregate(&points, AggregationInterval::OneMinute) {
                let expected = points
                    .iter()
                    .filter(|p| p.timestamp >= bucket.bucket_start && p.timestamp < bucket.bucket_end())
                    .count() as u64;
                prop_assert_eq!(bucket.count, expected);
            }
        }
    }
}
