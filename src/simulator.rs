// ============================================================================
// SYNTHETIC PRODUCER
// ============================================================================
// Synthetic metric producer for demos and load.
//
// Every tick emits one point per (service, metric type). Each series is a
// bounded random walk around a per-service baseline, with rare spikes.
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::pipeline::IngestPipeline;
use crate::types::{MetricPoint, MetricType, SeriesKey, Timestamp};

const REGIONS: &[&str] = &["us-east", "us-west", "eu-central", "ap-south"];

/// Shape of one synthetic series
#[derive(Debug, Clone, Copy)]
struct Shape {
    base: f64,
    /// Largest distance the walk may drift from `base`
    drift: f64,
    /// Per-tick noise amplitude
    jitter: f64,
    floor: f64,
    ceiling: f64,
    spike_chance: f64,
    spike: (f64, f64),
}

fn shape(service: &str, metric_type: MetricType) -> Shape {
    let pick = |auth: f64, api: f64, database: f64, cache: f64, queue: f64, other: f64| match service {
        "auth" => auth,
        "api" => api,
        "database" => database,
        "cache" => cache,
        "queue" => queue,
        _ => other,
    };

    match metric_type {
        MetricType::Latency => {
            let base = pick(50.0, 100.0, 30.0, 5.0, 20.0, 50.0);
            Shape {
                base,
                drift: 20.0,
                jitter: base * 0.1,
                floor: 1.0,
                ceiling: f64::MAX,
                spike_chance: 0.02,
                spike: (base * 2.0, base * 5.0),
            }
        }
        MetricType::Throughput => {
            let base = pick(1000.0, 5000.0, 2000.0, 10000.0, 3000.0, 1000.0);
            Shape {
                base,
                drift: base * 0.3,
                jitter: base * 0.05,
                floor: 10.0,
                ceiling: f64::MAX,
                spike_chance: 0.01,
                spike: (base * 0.5, base * 1.5),
            }
        }
        MetricType::ErrorRate => {
            let base = pick(0.001, 0.002, 0.0005, 0.0001, 0.001, 0.001);
            Shape {
                base,
                drift: base * 0.5,
                jitter: base * 0.5,
                floor: 0.0,
                ceiling: 1.0,
                spike_chance: 0.005,
                spike: (0.05, 0.15),
            }
        }
        MetricType::Cpu => Shape {
            base: pick(40.0, 60.0, 70.0, 30.0, 50.0, 50.0),
            drift: 15.0,
            jitter: 5.0,
            floor: 5.0,
            ceiling: 100.0,
            spike_chance: 0.01,
            spike: (20.0, 30.0),
        },
        MetricType::Memory => Shape {
            base: pick(50.0, 65.0, 80.0, 90.0, 55.0, 60.0),
            drift: 10.0,
            jitter: 3.0,
            floor: 10.0,
            ceiling: 100.0,
            spike_chance: 0.005,
            spike: (5.0, 15.0),
        },
    }
}

fn endpoints(service: &str) -> &'static [&'static str] {
    match service {
        "auth" => &["/login", "/logout", "/refresh", "/register"],
        "api" => &["/users", "/products", "/orders", "/search"],
        "database" => &["query", "insert", "update", "delete"],
        "cache" => &["get", "set", "delete", "flush"],
        "queue" => &["publish", "consume", "ack", "nack"],
        _ => &["/"],
    }
}

pub struct SyntheticProducer {
    services: Vec<String>,
    rng: StdRng,
    offsets: HashMap<SeriesKey, f64>,
}

impl SyntheticProducer {
    pub fn new(services: Vec<String>) -> Self {
        Self::with_rng(services, StdRng::from_entropy())
    }

    /// Deterministic producer for tests
    pub fn seeded(services: Vec<String>, seed: u64) -> Self {
        Self::with_rng(services, StdRng::seed_from_u64(seed))
    }

    fn with_rng(services: Vec<String>, rng: StdRng) -> Self {
        Self {
            services,
            rng,
            offsets: HashMap::new(),
        }
    }

    pub fn services(&self) -> &[String] {
        &self.services
    }

    /// One point per (service, metric type), all stamped `now`
    pub fn generate_batch(&mut self, now: Timestamp) -> Vec<MetricPoint> {
        let mut batch = Vec::with_capacity(self.services.len() * MetricType::ALL.len());
        let services = self.services.clone();

        for service in &services {
            let region = *REGIONS.choose(&mut self.rng).unwrap_or(&"us-east");
            for metric_type in MetricType::ALL {
                let value = self.step(service, metric_type);
                let point = MetricPoint::new(service.as_str(), metric_type, value).with_timestamp(now);
                let point = match metric_type {
                    MetricType::Latency => {
                        let endpoint = *endpoints(service).choose(&mut self.rng).unwrap_or(&"/");
                        let status_code: i64 = if self.rng.gen_bool(0.95) { 200 } else { 500 };
                        point
                            .with_tag("endpoint", endpoint)
                            .with_tag("region", region)
                            .with_tag("status_code", status_code)
                    }
                    MetricType::Throughput | MetricType::ErrorRate => point.with_tag("region", region),
                    MetricType::Cpu | MetricType::Memory => {
                        let host = format!("{}-{}", service, self.rng.gen_range(1..=3));
                        point.with_tag("host", host)
                    }
                };
                batch.push(point);
            }
        }
        batch
    }

    fn step(&mut self, service: &str, metric_type: MetricType) -> f64 {
        let shape = shape(service, metric_type);
        let offset = self
            .offsets
            .entry(SeriesKey::new(service, metric_type))
            .or_insert(0.0);

        let step = if shape.drift > 0.0 {
            self.rng.gen_range(-shape.drift..=shape.drift) * 0.1
        } else {
            0.0
        };
        *offset = (*offset + step).clamp(-shape.drift, shape.drift);

        let noise = if shape.jitter > 0.0 {
            self.rng.gen_range(-shape.jitter..=shape.jitter)
        } else {
            0.0
        };
        let spike = if self.rng.gen_bool(shape.spike_chance) {
            self.rng.gen_range(shape.spike.0..=shape.spike.1)
        } else {
            0.0
        };

        (shape.base + *offset + noise + spike).clamp(shape.floor, shape.ceiling)
    }

    /// Feed batches into `pipeline` every `interval` until cancelled
    pub async fn run(mut self, pipeline: Arc<IngestPipeline>, interval: Duration, token: CancellationToken) {
        info!(
            target: "pulse::simulator",
            services = self.services.len(),
            interval = ?interval,
            "Synthetic producer started"
        );
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let batch = self.generate_batch(Timestamp::now());
                    match pipeline.ingest_batch(batch).await {
                        Ok(alerts) => debug!(target: "pulse::simulator", alerts = alerts.len(), "Batch ingested"),
                        Err(e) => error!(target: "pulse::simulator", error = %e, "Batch ingest failed"),
                    }
                }
            }
        }
        info!(target: "pulse::simulator", "Synthetic producer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, SimulatorConfig};
    use crate::store::MemoryStore;
    use crate::telemetry::EngineMetrics;
    use crate::types::TagValue;

    fn producer() -> SyntheticProducer {
        SyntheticProducer::seeded(SimulatorConfig::default().services, 7)
    }

    #[test]
    fn test_batch_covers_every_series() {
        let mut producer = producer();
        let now = Timestamp::from_secs(1_700_000_000);
        let batch = producer.generate_batch(now);
        assert_eq!(batch.len(), 25);
        assert!(batch.iter().all(|p| p.timestamp == now));
        assert!(batch.iter().all(|p| p.validate().is_ok()));

        let latency = batch
            .iter()
            .find(|p| p.metric_type == MetricType::Latency)
            .unwrap();
        assert!(latency.tags.contains_key("endpoint"));
        assert!(matches!(latency.tags.get("status_code"), Some(TagValue::Int(200 | 500))));

        let cpu = batch.iter().find(|p| p.metric_type == MetricType::Cpu).unwrap();
        match cpu.tags.get("host") {
            Some(TagValue::Text(host)) => assert!(host.starts_with(cpu.service.as_str())),
            other => panic!("unexpected host tag {other:?}"),
        }
    }

    #[test]
    fn test_values_stay_in_bounds() {
        let mut producer = producer();
        for tick in 0..500 {
            for point in producer.generate_batch(Timestamp::from_secs(tick)) {
                assert!(point.value.is_finite());
                match point.metric_type {
                    MetricType::ErrorRate => assert!((0.0..=1.0).contains(&point.value)),
                    MetricType::Cpu | MetricType::Memory => {
                        assert!((5.0..=100.0).contains(&point.value))
                    }
                    MetricType::Latency => assert!(point.value >= 1.0),
                    MetricType::Throughput => assert!(point.value >= 10.0),
                }
            }
        }
    }

    #[tokio::test]
    async fn test_run_feeds_pipeline() {
        let pipeline = Arc::new(IngestPipeline::new(
            &EngineConfig::default(),
            Arc::new(MemoryStore::new()),
            EngineMetrics::new().unwrap(),
        ));
        let token = CancellationToken::new();
        let handle = tokio::spawn(producer().run(
            pipeline.clone(),
            Duration::from_millis(10),
            token.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(60)).await;
        token.cancel();
        handle.await.unwrap();

        assert!(pipeline.metrics().points_ingested.get() >= 25);
        assert_eq!(pipeline.list_services().await.unwrap().len(), 5);
    }
}
