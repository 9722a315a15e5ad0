// ============================================================================
// IN-MEMORY STORE
// ============================================================================
// Ordered tables behind one RwLock. Points are keyed by (timestamp, sequence)
// so equal timestamps never collide and range scans are ordered for free.
// ============================================================================

use std::collections::BTreeMap;

use async_trait::async_trait;
use compact_str::CompactString;
use parking_lot::RwLock;

use super::MetricStore;
use crate::error::StorageResult;
use crate::types::{
    AggregatedBucket, AggregationInterval, BucketKey, MetricPoint, MetricQuery, Timestamp,
};

#[derive(Debug, Default)]
pub(crate) struct Tables {
    points: BTreeMap<(Timestamp, u64), MetricPoint>,
    services: BTreeMap<CompactString, usize>,
    buckets: BTreeMap<BucketKey, AggregatedBucket>,
    next_sequence: u64,
}

impl Tables {
    pub(crate) fn insert(&mut self, point: MetricPoint) {
        let seq = self.next_sequence;
        self.next_sequence += 1;
        *self.services.entry(point.service.clone()).or_insert(0) += 1;
        self.points.insert((point.timestamp, seq), point);
    }

    pub(crate) fn purge_older_than(&mut self, cutoff: Timestamp) -> usize {
        let kept = self.points.split_off(&(cutoff, 0));
        let removed = std::mem::replace(&mut self.points, kept);
        for point in removed.values() {
            if let Some(count) = self.services.get_mut(&point.service) {
                *count -= 1;
                if *count == 0 {
                    self.services.remove(&point.service);
                }
            }
        }
        removed.len()
    }

    pub(crate) fn upsert_bucket(&mut self, bucket: AggregatedBucket) {
        self.buckets.insert(bucket.key(), bucket);
    }

    pub(crate) fn purge_buckets_older_than(&mut self, cutoff: Timestamp) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|key, _| key.bucket_start >= cutoff);
        before - self.buckets.len()
    }

    pub(crate) fn scan(&self, query: &MetricQuery, limit: Option<usize>) -> Vec<MetricPoint> {
        if query.start_time > query.end_time {
            return Vec::new();
        }
        let range = (query.start_time, 0)..=(query.end_time, u64::MAX);
        let matching = self
            .points
            .range(range)
            .rev()
            .map(|(_, p)| p)
            .filter(|p| query.matches(p));
        match limit {
            Some(limit) => matching.take(limit).cloned().collect(),
            None => matching.cloned().collect(),
        }
    }

    pub(crate) fn latest(&self, n: usize) -> Vec<MetricPoint> {
        self.points.values().rev().take(n).cloned().collect()
    }

    pub(crate) fn services(&self) -> Vec<String> {
        self.services.keys().map(|s| s.to_string()).collect()
    }

    pub(crate) fn scan_buckets(
        &self,
        interval: AggregationInterval,
        query: &MetricQuery,
    ) -> Vec<AggregatedBucket> {
        let mut buckets: Vec<_> = self
            .buckets
            .iter()
            .filter(|(key, bucket)| key.interval == interval && query.matches_bucket(bucket))
            .map(|(_, bucket)| bucket.clone())
            .collect();
        buckets.sort_by(|a, b| {
            (a.bucket_start, &a.service, a.metric_type).cmp(&(b.bucket_start, &b.service, b.metric_type))
        });
        buckets
    }

    pub(crate) fn all_points(&self) -> impl Iterator<Item = &MetricPoint> {
        self.points.values()
    }

    pub(crate) fn all_buckets(&self) -> impl Iterator<Item = &AggregatedBucket> {
        self.buckets.values()
    }

    pub(crate) fn point_count(&self) -> usize {
        self.points.len()
    }

    pub(crate) fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

/// Volatile store for development and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn point_count(&self) -> usize {
        self.tables.read().point_count()
    }

    pub fn bucket_count(&self) -> usize {
        self.tables.read().bucket_count()
    }
}

#[async_trait]
impl MetricStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn insert(&self, point: &MetricPoint) -> StorageResult<()> {
        self.tables.write().insert(point.clone());
        Ok(())
    }

    async fn insert_batch(&self, points: &[MetricPoint]) -> StorageResult<()> {
        let mut tables = self.tables.write();
        for point in points {
            tables.insert(point.clone());
        }
        Ok(())
    }

    async fn scan(
        &self,
        query: &MetricQuery,
        limit: Option<usize>,
    ) -> StorageResult<Vec<MetricPoint>> {
        Ok(self.tables.read().scan(query, limit))
    }

    async fn latest(&self, n: usize) -> StorageResult<Vec<MetricPoint>> {
        Ok(self.tables.read().latest(n))
    }

    async fn list_services(&self) -> StorageResult<Vec<String>> {
        Ok(self.tables.read().services())
    }

    async fn purge_older_than(&self, cutoff: Timestamp) -> StorageResult<usize> {
        Ok(self.tables.write().purge_older_than(cutoff))
    }

    async fn upsert_buckets(&self, buckets: &[AggregatedBucket]) -> StorageResult<usize> {
        let mut tables = self.tables.write();
        for bucket in buckets {
            tables.upsert_bucket(bucket.clone());
        }
        Ok(buckets.len())
    }

    async fn scan_buckets(
        &self,
        interval: AggregationInterval,
        query: &MetricQuery,
    ) -> StorageResult<Vec<AggregatedBucket>> {
        Ok(self.tables.read().scan_buckets(interval, query))
    }

    async fn purge_buckets_older_than(&self, cutoff: Timestamp) -> StorageResult<usize> {
        Ok(self.tables.write().purge_buckets_older_than(cutoff))
    }

    async fn sync(&self) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MetricType;
    use pretty_assertions::assert_eq;

    fn at(secs: i64, service: &str, metric_type: MetricType) -> MetricPoint {
        MetricPoint::new(service, metric_type, secs as f64).with_timestamp(Timestamp::from_secs(secs))
    }

    #[tokio::test]
    async fn test_scan_filters() {
        let store = MemoryStore::new();
        store
            .insert_batch(&[
                at(10, "auth", MetricType::Latency),
                at(20, "api", MetricType::Latency),
                at(30, "auth", MetricType::Cpu),
                at(40, "auth", MetricType::Latency),
            ])
            .await
            .unwrap();

        let query = MetricQuery::range(Timestamp::from_secs(0), Timestamp::from_secs(35))
            .with_services(["auth"]);
        let values: Vec<f64> = store.scan(&query, None).await.unwrap().iter().map(|p| p.value).collect();
        assert_eq!(values, vec![30.0, 10.0]);

        let query = MetricQuery::range(Timestamp::from_secs(0), Timestamp::from_secs(100))
            .with_metric_types([MetricType::Latency]);
        assert_eq!(store.scan(&query, Some(2)).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_timestamps_kept() {
        let store = MemoryStore::new();
        store.insert(&at(5, "auth", MetricType::Cpu)).await.unwrap();
        store.insert(&at(5, "auth", MetricType::Cpu)).await.unwrap();
        assert_eq!(store.point_count(), 2);
    }

    #[tokio::test]
    async fn test_purge_is_idempotent() {
        let store = MemoryStore::new();
        for secs in [10, 20, 30] {
            store.insert(&at(secs, "auth", MetricType::Cpu)).await.unwrap();
        }
        store.insert(&at(15, "old", MetricType::Cpu)).await.unwrap();

        assert_eq!(store.purge_older_than(Timestamp::from_secs(20)).await.unwrap(), 2);
        assert_eq!(store.purge_older_than(Timestamp::from_secs(20)).await.unwrap(), 0);
        assert_eq!(store.point_count(), 2);
        assert_eq!(store.list_services().await.unwrap(), vec!["auth".to_string()]);
    }

    #[tokio::test]
    async fn test_latest_newest_first() {
        let store = MemoryStore::new();
        for secs in [3, 1, 2] {
            store.insert(&at(secs, "auth", MetricType::Cpu)).await.unwrap();
        }
        let latest: Vec<f64> = store.latest(2).await.unwrap().iter().map(|p| p.value).collect();
        assert_eq!(latest, vec![3.0, 2.0]);
    }

    #[tokio::test]
    async fn test_bucket_upsert_and_purge() {
        let store = MemoryStore::new();
        let points = vec![at(0, "auth", MetricType::Cpu), at(3600, "auth", MetricType::Cpu)];
        let buckets = crate::aggregator::aggregate(&points, AggregationInterval::OneMinute);
        assert_eq!(store.upsert_buckets(&buckets).await.unwrap(), 2);
        store.upsert_buckets(&buckets).await.unwrap();
        assert_eq!(store.bucket_count(), 2);

        assert_eq!(
            store.purge_buckets_older_than(Timestamp::from_secs(60)).await.unwrap(),
            1
        );
        let query = MetricQuery::range(Timestamp::from_secs(0), Timestamp::from_secs(7200));
        let remaining = store
            .scan_buckets(AggregationInterval::OneMinute, &query)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(store
            .scan_buckets(AggregationInterval::OneHour, &query)
            .await
            .unwrap()
            .is_empty());
    }
}
