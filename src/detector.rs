// ============================================================================
// ANOMALY DETECTION
// ============================================================================
// Static two-level thresholds per metric type. Detection is a pure function
// of the point and the configured levels: no state, no I/O.
// ============================================================================

use std::collections::BTreeMap;

use crate::config::{ThresholdLevels, ThresholdsConfig};
use crate::types::{Alert, HealthStatus, MetricPoint, MetricSummary, MetricType, Severity};

/// Direction in which a value is considered bad
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    /// Trips when `value > threshold`
    Above,
    /// Trips when `value < threshold`
    Below,
}

impl Comparison {
    /// Fixed per metric type. Low throughput is bad; everything else is bad when high.
    pub const fn for_metric(metric_type: MetricType) -> Self {
        match metric_type {
            MetricType::Throughput => Comparison::Below,
            MetricType::Latency | MetricType::ErrorRate | MetricType::Cpu | MetricType::Memory => {
                Comparison::Above
            }
        }
    }

    #[inline]
    pub fn trips(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::Above => value > threshold,
            Comparison::Below => value < threshold,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Comparison::Above => "above",
            Comparison::Below => "below",
        }
    }
}

/// Levels plus direction for one metric type
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdRule {
    pub levels: ThresholdLevels,
    pub comparison: Comparison,
}

impl ThresholdRule {
    /// Critical is checked first; returns the severity and the crossed limit
    pub fn classify(&self, value: f64) -> Option<(Severity, f64)> {
        if self.comparison.trips(value, self.levels.critical) {
            Some((Severity::Critical, self.levels.critical))
        } else if self.comparison.trips(value, self.levels.warning) {
            Some((Severity::Warning, self.levels.warning))
        } else {
            None
        }
    }
}

/// Maps metric points to optional alerts.
#[derive(Debug, Clone)]
pub struct AnomalyDetector {
    rules: BTreeMap<MetricType, ThresholdRule>,
}

impl AnomalyDetector {
    pub fn new(thresholds: &ThresholdsConfig) -> Self {
        let rules = MetricType::ALL
            .iter()
            .map(|t| {
                (
                    *t,
                    ThresholdRule {
                        levels: thresholds.levels(*t),
                        comparison: Comparison::for_metric(*t),
                    },
                )
            })
            .collect();
        Self { rules }
    }

    pub fn rule(&self, metric_type: MetricType) -> Option<&ThresholdRule> {
        self.rules.get(&metric_type)
    }

    pub fn classify(&self, metric_type: MetricType, value: f64) -> Option<(Severity, f64)> {
        self.rule(metric_type)?.classify(value)
    }

    pub fn detect(&self, point: &MetricPoint) -> Option<Alert> {
        let rule = self.rule(point.metric_type)?;
        let (severity, threshold) = rule.classify(point.value)?;
        let message = match rule.comparison {
            Comparison::Above => {
                format!("{} threshold exceeded for {}", point.metric_type, point.service)
            }
            Comparison::Below => {
                format!("{} below threshold for {}", point.metric_type, point.service)
            }
        };
        Some(Alert::new(point, severity, threshold, message))
    }

    /// Worst severity tripped by any metric's current value
    pub fn health_status(&self, metrics: &BTreeMap<MetricType, MetricSummary>) -> HealthStatus {
        let worst = metrics
            .iter()
            .filter_map(|(t, s)| self.classify(*t, s.current).map(|(sev, _)| sev))
            .max();
        match worst {
            Some(Severity::Critical) => HealthStatus::Unhealthy,
            Some(Severity::Warning) => HealthStatus::Degraded,
            None => HealthStatus::Healthy,
        }
    }
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::new(&ThresholdsConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn check(metric_type: MetricType, value: f64) -> Option<Alert> {
        AnomalyDetector::default().detect(&MetricPoint::new("svc", metric_type, value))
    }

    #[test]
    fn test_over_threshold_types() {
        assert!(check(MetricType::Latency, 450.0).is_none());
        assert_eq!(check(MetricType::Latency, 600.0).unwrap().severity, Severity::Warning);
        let alert = check(MetricType::Latency, 1500.0).unwrap();
        assert_eq!(alert.severity, Severity::Critical);
        assert_eq!(alert.threshold, 1000.0);
        assert_eq!(alert.message, "latency threshold exceeded for svc");

        assert_eq!(check(MetricType::Cpu, 96.0).unwrap().severity, Severity::Critical);
        assert_eq!(check(MetricType::Memory, 85.0).unwrap().severity, Severity::Warning);
        assert!(check(MetricType::ErrorRate, 0.01).is_none());
    }

    #[test]
    fn test_threshold_boundaries_are_strict() {
        assert!(check(MetricType::Latency, 500.0).is_none());
        assert_eq!(check(MetricType::Latency, 1000.0).unwrap().severity, Severity::Warning);
        assert!(check(MetricType::Throughput, 100.0).is_none());
        assert_eq!(check(MetricType::Throughput, 50.0).unwrap().severity, Severity::Warning);
    }

    #[test]
    fn test_throughput_is_inverted() {
        let alert = check(MetricType::Throughput, 40.0).unwrap();
        assert_eq!(alert.severity, Severity::Critical);
        assert_eq!(alert.threshold, 50.0);
        assert_eq!(alert.message, "throughput below threshold for svc");

        let alert = check(MetricType::Throughput, 80.0).unwrap();
        assert_eq!(alert.severity, Severity::Warning);
        assert_eq!(alert.threshold, 100.0);

        assert!(check(MetricType::Throughput, 500.0).is_none());
    }

    #[test]
    fn test_error_rate_critical() {
        let point = MetricPoint::new("x", MetricType::ErrorRate, 0.95);
        let alert = AnomalyDetector::default().detect(&point).unwrap();
        assert_eq!(alert.severity, Severity::Critical);
        assert_eq!(alert.threshold, 0.10);
        assert_eq!(alert.value, 0.95);
        assert_eq!(alert.service.as_str(), "x");
        assert_eq!(alert.timestamp, point.timestamp);
    }

    #[test]
    fn test_alert_ids_unique() {
        let a = check(MetricType::Cpu, 99.0).unwrap();
        let b = check(MetricType::Cpu, 99.0).unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_health_status() {
        let detector = AnomalyDetector::default();
        let summary = |current: f64| MetricSummary {
            current,
            p50: current,
            p95: current,
            p99: current,
            min: current,
            max: current,
            avg: current,
            count: 1,
        };

        let mut metrics = BTreeMap::new();
        metrics.insert(MetricType::Latency, summary(100.0));
        metrics.insert(MetricType::Throughput, summary(500.0));
        assert_eq!(detector.health_status(&metrics), HealthStatus::Healthy);

        metrics.insert(MetricType::Cpu, summary(85.0));
        assert_eq!(detector.health_status(&metrics), HealthStatus::Degraded);

        metrics.insert(MetricType::Throughput, summary(10.0));
        assert_eq!(detector.health_status(&metrics), HealthStatus::Unhealthy);

        assert_eq!(detector.health_status(&BTreeMap::new()), HealthStatus::Healthy);
    }

    fn rank(alert: Option<Alert>) -> u8 {
        match alert.map(|a| a.severity) {
            None => 0,
            Some(Severity::Warning) => 1,
            Some(Severity::Critical) => 2,
        }
    }

    proptest! {
        #[test]
        fn prop_severity_monotonic_for_over_types(
            idx in 0usize..4,
            a in 0.0f64..2000.0,
            b in 0.0f64..2000.0,
        ) {
            let metric_type = [
                MetricType::Latency,
                MetricType::ErrorRate,
                MetricType::Cpu,
                MetricType::Memory,
            ][idx];
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(rank(check(metric_type, lo)) <= rank(check(metric_type, hi)));
        }

        #[test]
        fn prop_throughput_monotonic_downward(a in 0.0f64..500.0, b in 0.0f64..500.0) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(rank(check(MetricType::Throughput, lo)) >= rank(check(MetricType::Throughput, hi)));
        }
    }
}
