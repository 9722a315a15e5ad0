// ============================================================================
// METRIC STORE
// ============================================================================
// Time-indexed metric storage.
//
// Two backends implement `MetricStore`:
// - `memory::MemoryStore`: ordered in-memory tables, lost on restart
// - `wal::WalStore`: the same tables rebuilt from an append-only log
//
// Every mutation takes the table write lock for its whole duration, so a
// query observes each insert or purge entirely or not at all.
// ============================================================================

pub mod memory;
pub mod wal;

use async_trait::async_trait;

use crate::aggregator::{aggregate, merge_persisted};
use crate::error::StorageResult;
use crate::types::{
    AggregatedBucket, Aggregation, AggregationInterval, MetricPoint, MetricQuery, QueryResult,
    Timestamp,
};

pub use memory::MemoryStore;
pub use wal::{WalStats, WalStore};

#[async_trait]
pub trait MetricStore: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Append one point atomically
    async fn insert(&self, point: &MetricPoint) -> StorageResult<()>;

    /// Append a batch atomically: all points become visible together
    async fn insert_batch(&self, points: &[MetricPoint]) -> StorageResult<()>;

    /// Points matching `query`, newest first, at most `limit` if given
    async fn scan(&self, query: &MetricQuery, limit: Option<usize>)
        -> StorageResult<Vec<MetricPoint>>;

    /// The `n` newest points across all series, newest first
    async fn latest(&self, n: usize) -> StorageResult<Vec<MetricPoint>>;

    /// Distinct services with at least one retained point, sorted
    async fn list_services(&self) -> StorageResult<Vec<String>>;

    /// Delete raw points with `timestamp < cutoff`. Returns the number removed.
    async fn purge_older_than(&self, cutoff: Timestamp) -> StorageResult<usize>;

    /// Insert or replace persisted rollup buckets
    async fn upsert_buckets(&self, buckets: &[AggregatedBucket]) -> StorageResult<usize>;

    /// Persisted buckets of `interval` matching `query`, by bucket start
    async fn scan_buckets(
        &self,
        interval: AggregationInterval,
        query: &MetricQuery,
    ) -> StorageResult<Vec<AggregatedBucket>>;

    /// Delete persisted buckets starting before `cutoff`
    async fn purge_buckets_older_than(&self, cutoff: Timestamp) -> StorageResult<usize>;

    /// Flush to durable media, if any
    async fn sync(&self) -> StorageResult<()>;
}

/// Run a query against a store.
///
/// Raw results are newest first and capped at `raw_limit`. Bucketed results
/// are recomputed from raw points in range; persisted rollups fill in only
/// buckets that no longer have raw data.
pub async fn execute_query(
    store: &dyn MetricStore,
    query: &MetricQuery,
    raw_limit: usize,
) -> StorageResult<QueryResult> {
    match query.aggregation {
        Aggregation::Raw => Ok(QueryResult::Points(store.scan(query, Some(raw_limit)).await?)),
        Aggregation::Bucketed(interval) => {
            let points = store.scan(query, None).await?;
            let computed = aggregate(&points, interval);
            let persisted = store.scan_buckets(interval, query).await?;
            Ok(QueryResult::Buckets(merge_persisted(computed, persisted, query)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MetricType;

    fn at(secs: i64, service: &str, value: f64) -> MetricPoint {
        MetricPoint::new(service, MetricType::Latency, value).with_timestamp(Timestamp::from_secs(secs))
    }

    #[tokio::test]
    async fn test_raw_query_is_capped_and_descending() {
        let store = MemoryStore::new();
        let points: Vec<_> = (0..50).map(|i| at(i, "auth", i as f64)).collect();
        store.insert_batch(&points).await.unwrap();

        let query = MetricQuery::range(Timestamp::from_secs(0), Timestamp::from_secs(100));
        let QueryResult::Points(result) = execute_query(&store, &query, 10).await.unwrap() else {
            panic!("expected raw points");
        };
        assert_eq!(result.len(), 10);
        assert_eq!(result[0].value, 49.0);
        assert!(result.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
    }

    #[tokio::test]
    async fn test_bucketed_query_ignores_raw_cap() {
        let store = MemoryStore::new();
        let points: Vec<_> = (0..120).map(|i| at(i, "auth", 1.0)).collect();
        store.insert_batch(&points).await.unwrap();

        let query = MetricQuery::range(Timestamp::from_secs(0), Timestamp::from_secs(119))
            .with_aggregation(Aggregation::Bucketed(AggregationInterval::OneMinute));
        let QueryResult::Buckets(buckets) = execute_query(&store, &query, 10).await.unwrap() else {
            panic!("expected buckets");
        };
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets.iter().map(|b| b.count).sum::<u64>(), 120);
    }

    #[tokio::test]
    async fn test_persisted_buckets_survive_raw_purge() {
        let store = MemoryStore::new();
        let points: Vec<_> = (0..60).map(|i| at(i, "auth", i as f64)).collect();
        store.insert_batch(&points).await.unwrap();
        store
            .upsert_buckets(&aggregate(&points, AggregationInterval::OneMinute))
            .await
            .unwrap();
        store.purge_older_than(Timestamp::from_secs(3600)).await.unwrap();

        let query = MetricQuery::range(Timestamp::from_secs(0), Timestamp::from_secs(3600))
            .with_aggregation(Aggregation::Bucketed(AggregationInterval::OneMinute));
        let result = execute_query(&store, &query, 10_000).await.unwrap();
        let QueryResult::Buckets(buckets) = result else {
            panic!("expected buckets");
        };
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].count, 60);
        assert_eq!(buckets[0].p50, 30.0);
    }
}
