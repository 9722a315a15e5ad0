// ============================================================================
// LIVE WINDOW
// ============================================================================
// Bounded FIFO of the most recent samples per (service, metric type).
//
// The outer map is sharded (DashMap) so pushes to distinct series rarely
// contend. Each series has its own mutex, which serializes pushes to the same
// key; the capacity bound is re-established inside that critical section on
// every push. Series locks are only taken while the owning shard is held.
// ============================================================================

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::aggregator::summarize;
use crate::types::{MetricPoint, MetricSummary, MetricType, SeriesKey, Timestamp};

/// One retained measurement
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowSample {
    pub timestamp: Timestamp,
    pub value: f64,
}

type Series = Arc<Mutex<VecDeque<WindowSample>>>;

/// Per-series bounded deques of recent samples.
pub struct LiveWindow {
    series: DashMap<SeriesKey, Series>,
    capacity: usize,
}

impl LiveWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            series: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a point, evicting the oldest sample if the series is full.
    /// Returns the evicted sample, if any.
    ///
    /// The map entry stays borrowed while the sample is written, so
    /// `evict_older_than` cannot drop the series out from under the push.
    pub fn push(&self, point: &MetricPoint) -> Option<WindowSample> {
        let sample = WindowSample {
            timestamp: point.timestamp,
            value: point.value,
        };
        let key = point.series_key();
        if let Some(series) = self.series.get(&key) {
            return self.append(series.value(), sample);
        }
        let series = self
            .series
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(VecDeque::with_capacity(self.capacity))));
        self.append(series.value(), sample)
    }

    fn append(&self, series: &Series, sample: WindowSample) -> Option<WindowSample> {
        let mut deque = series.lock();
        deque.push_back(sample);
        let evicted = if deque.len() > self.capacity {
            deque.pop_front()
        } else {
            None
        };
        debug_assert!(deque.len() <= self.capacity);
        evicted
    }

    /// Values of one series, most-recent-last
    pub fn snapshot(&self, service: &str, metric_type: MetricType) -> Vec<f64> {
        self.samples(service, metric_type)
            .into_iter()
            .map(|s| s.value)
            .collect()
    }

    /// Samples of one series, most-recent-last
    pub fn samples(&self, service: &str, metric_type: MetricType) -> Vec<WindowSample> {
        let key = SeriesKey::new(service, metric_type);
        let Some(series) = self.series.get(&key).map(|s| Arc::clone(s.value())) else {
            return Vec::new();
        };
        let deque = series.lock();
        deque.iter().copied().collect()
    }

    pub fn latest(&self, service: &str, metric_type: MetricType) -> Option<WindowSample> {
        let key = SeriesKey::new(service, metric_type);
        let series = self.series.get(&key).map(|s| Arc::clone(s.value()))?;
        let deque = series.lock();
        deque.back().copied()
    }

    /// Statistics over one series; `None` if it holds no samples
    pub fn summary(&self, service: &str, metric_type: MetricType) -> Option<MetricSummary> {
        let samples = self.snapshot(service, metric_type);
        let current = *samples.last()?;
        let stats = summarize(&samples)?;
        Some(MetricSummary {
            current,
            p50: stats.p50,
            p95: stats.p95,
            p99: stats.p99,
            min: stats.min,
            max: stats.max,
            avg: stats.avg,
            count: stats.count,
        })
    }

    /// Per-metric-type summaries for one service
    pub fn service_summaries(&self, service: &str) -> BTreeMap<MetricType, MetricSummary> {
        MetricType::ALL
            .iter()
            .filter_map(|t| self.summary(service, *t).map(|s| (*t, s)))
            .collect()
    }

    /// Services with at least one retained sample, sorted
    pub fn services(&self) -> Vec<String> {
        let mut services = BTreeSet::new();
        for entry in self.series.iter() {
            if !entry.value().lock().is_empty() {
                services.insert(entry.key().service.to_string());
            }
        }
        services.into_iter().collect()
    }

    /// Drop samples older than `cutoff`. Only the front of each deque is
    /// inspected, so FIFO order is preserved. Returns the number removed.
    pub fn evict_older_than(&self, cutoff: Timestamp) -> usize {
        let mut removed = 0;
        for entry in self.series.iter() {
            let mut deque = entry.value().lock();
            while deque.front().is_some_and(|s| s.timestamp < cutoff) {
                deque.pop_front();
                removed += 1;
            }
        }
        self.series.retain(|_, series| !series.lock().is_empty());
        removed
    }

    pub fn len(&self, service: &str, metric_type: MetricType) -> usize {
        let key = SeriesKey::new(service, metric_type);
        self.series
            .get(&key)
            .map(|s| s.value().lock().len())
            .unwrap_or(0)
    }

    /// Number of tracked series
    pub fn series_count(&self) -> usize {
        self.series.len()
    }

    /// Total samples across all series
    pub fn total_samples(&self) -> usize {
        self.series.iter().map(|e| e.value().lock().len()).sum()
    }
}

impl Default for LiveWindow {
    fn default() -> Self {
        Self::new(crate::DEFAULT_WINDOW_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn point(service: &str, metric_type: MetricType, value: f64, secs: i64) -> MetricPoint {
        MetricPoint::new(service, metric_type, value).with_timestamp(Timestamp::from_secs(secs))
    }

    #[test]
    fn test_fifo_eviction() {
        let window = LiveWindow::new(3);
        for i in 0..3 {
            assert!(window.push(&point("auth", MetricType::Latency, i as f64, i)).is_none());
        }
        let evicted = window.push(&point("auth", MetricType::Latency, 3.0, 3)).unwrap();

        assert_eq!(evicted.value, 0.0);
        assert_eq!(window.snapshot("auth", MetricType::Latency), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_default_capacity_holds_thousand() {
        let window = LiveWindow::default();
        for i in 0..1500 {
            window.push(&point("api", MetricType::Cpu, i as f64, i));
        }
        let values = window.snapshot("api", MetricType::Cpu);
        assert_eq!(values.len(), 1000);
        assert_eq!(values.first().copied(), Some(500.0));
        assert_eq!(values.last().copied(), Some(1499.0));
    }

    #[test]
    fn test_series_are_independent() {
        let window = LiveWindow::new(2);
        window.push(&point("auth", MetricType::Latency, 1.0, 1));
        window.push(&point("auth", MetricType::Cpu, 2.0, 1));
        window.push(&point("api", MetricType::Latency, 3.0, 1));

        assert_eq!(window.series_count(), 3);
        assert_eq!(window.len("auth", MetricType::Latency), 1);
        assert_eq!(window.services(), vec!["api".to_string(), "auth".to_string()]);
        assert!(window.snapshot("cache", MetricType::Latency).is_empty());
    }

    #[test]
    fn test_summary_reports_current() {
        let window = LiveWindow::new(10);
        for (i, v) in [10.0, 30.0, 20.0].into_iter().enumerate() {
            window.push(&point("db", MetricType::Latency, v, i as i64));
        }
        let summary = window.summary("db", MetricType::Latency).unwrap();
        assert_eq!(summary.current, 20.0);
        assert_eq!(summary.min, 10.0);
        assert_eq!(summary.max, 30.0);
        assert_eq!(summary.avg, 20.0);
        assert_eq!(summary.count, 3);
        assert!(window.summary("db", MetricType::Cpu).is_none());
    }

    #[test]
    fn test_age_eviction_front_only() {
        let window = LiveWindow::new(10);
        window.push(&point("q", MetricType::Throughput, 1.0, 100));
        window.push(&point("q", MetricType::Throughput, 2.0, 200));
        window.push(&point("q", MetricType::Throughput, 3.0, 300));
        window.push(&point("old", MetricType::Throughput, 4.0, 50));

        let removed = window.evict_older_than(Timestamp::from_secs(250));
        assert_eq!(removed, 3);
        assert_eq!(window.snapshot("q", MetricType::Throughput), vec![3.0]);
        assert_eq!(window.services(), vec!["q".to_string()]);
    }

    #[test]
    fn test_concurrent_pushes_same_key() {
        let window = Arc::new(LiveWindow::new(100));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let window = Arc::clone(&window);
                std::thread::spawn(move || {
                    for i in 0..500 {
                        window.push(&point("auth", MetricType::Latency, (t * 1000 + i) as f64, i));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(window.len("auth", MetricType::Latency), 100);
    }

    #[test]
    fn test_pushes_survive_concurrent_eviction() {
        let window = Arc::new(LiveWindow::new(100_000));
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let cutoff = Timestamp::from_secs(1_000);

        let evictor = {
            let window = Arc::clone(&window);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                let mut removed = 0;
                while !done.load(std::sync::atomic::Ordering::Acquire) {
                    removed += window.evict_older_than(cutoff);
                }
                removed
            })
        };

        let pushers: Vec<_> = (0..4)
            .map(|t| {
                let window = Arc::clone(&window);
                std::thread::spawn(move || {
                    for i in 0..2_000 {
                        window.push(&point(&format!("svc-{t}"), MetricType::Cpu, i as f64, 1));
                    }
                })
            })
            .collect();
        for h in pushers {
            h.join().unwrap();
        }
        done.store(true, std::sync::atomic::Ordering::Release);
        let removed = evictor.join().unwrap();

        assert_eq!(removed + window.total_samples(), 8_000);
        assert_eq!(window.evict_older_than(cutoff) + removed, 8_000);
        assert_eq!(window.series_count(), 0);
    }

    proptest! {
        #[test]
        fn prop_length_never_exceeds_capacity(
            capacity in 1usize..64,
            values in prop::collection::vec(-1e6f64..1e6, 0..300),
        ) {
            let window = LiveWindow::new(capacity);
            for (i, v) in values.iter().enumerate() {
                window.push(&point("svc", MetricType::Memory, *v, i as i64));
                prop_assert!(window.len("svc", MetricType::Memory) <= capacity);
            }
            let expected: Vec<f64> = values
                .iter()
                .skip(values.len().saturating_sub(capacity))
                .copied()
                .collect();
            prop_assert_eq!(window.snapshot("svc", MetricType::Memory), expected);
        }
    }
}
