// ============================================================================
// ALERT HISTORY
// ============================================================================
// Bounded most-recent-first alert history.
// ============================================================================

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::types::Alert;

pub struct AlertLog {
    entries: Mutex<VecDeque<Alert>>,
    capacity: usize,
}

impl AlertLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Record an alert, dropping the oldest once full
    pub fn push(&self, alert: Alert) {
        let mut entries = self.entries.lock();
        entries.push_back(alert);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// Up to `limit` alerts, newest first
    pub fn recent(&self, limit: usize) -> Vec<Alert> {
        self.entries.lock().iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for AlertLog {
    fn default() -> Self {
        Self::new(crate::DEFAULT_ALERT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MetricPoint, MetricType, Severity};

    fn alert(value: f64) -> Alert {
        let point = MetricPoint::new("svc", MetricType::Cpu, value);
        Alert::new(&point, Severity::Critical, 95.0, "cpu threshold exceeded for svc".into())
    }

    #[test]
    fn test_bounded_and_newest_first() {
        let log = AlertLog::default();
        for i in 0..150 {
            log.push(alert(100.0 + i as f64));
        }
        assert_eq!(log.len(), 100);

        let recent = log.recent(3);
        let values: Vec<f64> = recent.iter().map(|a| a.value).collect();
        assert_eq!(values, vec![249.0, 248.0, 247.0]);

        let all = log.recent(1_000);
        assert_eq!(all.len(), 100);
        assert_eq!(all.last().map(|a| a.value), Some(150.0));
    }

    #[test]
    fn test_zero_limit() {
        let log = AlertLog::new(5);
        log.push(alert(99.0));
        assert!(log.recent(0).is_empty());
        assert!(!log.is_empty());
    }
}
