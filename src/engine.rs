// ============================================================================
// ENGINE LIFECYCLE
// ============================================================================
// Engine assembly and lifecycle.
//
// `Engine::new` validates configuration and opens the store; `run` starts
// the background tasks and the HTTP server, then blocks until SIGINT/SIGTERM
// or `Engine::shutdown`.
// ============================================================================

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::aggregator::RollupScheduler;
use crate::config::{EngineConfig, StorageBackend};
use crate::error::{PulseError, PulseResult};
use crate::hub::HubStats;
use crate::pipeline::IngestPipeline;
use crate::simulator::SyntheticProducer;
use crate::store::{MemoryStore, MetricStore, WalStore};
use crate::sweeper::RetentionSweeper;
use crate::telemetry::EngineMetrics;
use crate::ENGINE_VERSION;

pub struct Engine {
    config: EngineConfig,
    pipeline: Arc<IngestPipeline>,
    shutdown: CancellationToken,
    running: AtomicBool,
    start_time: Instant,
}

impl Engine {
    /// Validate `config` and open the configured store. Fails fast on any
    /// configuration or storage error.
    pub fn new(config: EngineConfig) -> PulseResult<Self> {
        config.validate()?;

        let store: Arc<dyn MetricStore> = match config.storage.backend {
            StorageBackend::Memory => Arc::new(MemoryStore::new()),
            StorageBackend::Wal => Arc::new(WalStore::open(
                &config.storage.data_dir,
                config.storage.sync_every_write,
            )?),
        };
        let metrics = EngineMetrics::new().map_err(|e| PulseError::Internal(e.to_string()))?;
        let pipeline = Arc::new(IngestPipeline::new(&config, store, metrics));

        info!(
            target: "pulse::engine",
            instance = %config.engine.instance_name,
            backend = pipeline.store().name(),
            "Engine initialized"
        );

        Ok(Self {
            config,
            pipeline,
            shutdown: CancellationToken::new(),
            running: AtomicBool::new(false),
            start_time: Instant::now(),
        })
    }

    pub fn from_config_file<P: AsRef<Path>>(path: P) -> PulseResult<Self> {
        Self::new(EngineConfig::load(path)?)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &Arc<IngestPipeline> {
        &self.pipeline
    }

    pub fn is_running(&self) -> bool {
        self.running.load(AtomicOrdering::Acquire)
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Signal shutdown
    pub fn shutdown(&self) {
        info!(target: "pulse::engine", "Shutdown requested");
        self.shutdown.cancel();
    }

    /// Bind the configured address and run until shutdown
    pub async fn run(&self) -> PulseResult<()> {
        let addr = self.config.server.socket_addr()?;
        let listener = TcpListener::bind(addr).await?;
        self.run_with_listener(listener).await
    }

    pub async fn run_with_listener(&self, listener: TcpListener) -> PulseResult<()> {
        info!(
            target: "pulse::engine",
            version = ENGINE_VERSION,
            instance = %self.config.engine.instance_name,
            "Starting engine"
        );
        self.running.store(true, AtomicOrdering::Release);

        spawn_signal_handler(self.shutdown.clone());
        let tasks = self.spawn_background_tasks();

        let served = crate::server::serve(
            listener,
            Arc::clone(&self.pipeline),
            self.config.server.cors_permissive,
            self.shutdown.clone(),
        )
        .await;
        if let Err(e) = &served {
            error!(target: "pulse::engine", error = %e, "HTTP server failed");
        }

        // The server also returns on failure; stop everything else either way.
        self.shutdown.cancel();
        self.drain(tasks).await;
        self.running.store(false, AtomicOrdering::Release);
        served
    }

    fn spawn_background_tasks(&self) -> Vec<(&'static str, JoinHandle<()>)> {
        let store = Arc::clone(self.pipeline.store());
        let mut tasks = Vec::new();

        let sweeper = RetentionSweeper::new(
            Arc::clone(&store),
            Arc::clone(self.pipeline.window()),
            self.config.retention.clone(),
            self.pipeline.metrics().clone(),
        );
        tasks.push(("sweeper", tokio::spawn(sweeper.run(self.shutdown.clone()))));

        if self.config.rollup.enabled {
            let rollup = RollupScheduler::new(
                Arc::clone(&store),
                self.config.rollup.interval,
                self.config.rollup.lookback,
            );
            tasks.push(("rollup", tokio::spawn(rollup.run(self.shutdown.clone()))));
        }

        if self.config.simulator.enabled {
            let producer = SyntheticProducer::new(self.config.simulator.services.clone());
            tasks.push((
                "simulator",
                tokio::spawn(producer.run(
                    Arc::clone(&self.pipeline),
                    self.config.simulator.interval,
                    self.shutdown.clone(),
                )),
            ));
        }
        tasks
    }

    async fn drain(&self, tasks: Vec<(&'static str, JoinHandle<()>)>) {
        info!(target: "pulse::engine", "Starting graceful shutdown");
        let started = Instant::now();
        let grace = Duration::from_secs(self.config.engine.shutdown_timeout_secs);

        self.pipeline.hub().shutdown();

        for (name, handle) in tasks {
            let remaining = grace.saturating_sub(started.elapsed());
            match tokio::time::timeout(remaining, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(target: "pulse::engine", task = name, error = %e, "Task panicked"),
                Err(_) => warn!(target: "pulse::engine", task = name, "Task did not stop in time"),
            }
        }

        if let Err(e) = self.pipeline.store().sync().await {
            error!(target: "pulse::engine", error = %e, "Final store sync failed");
        }

        info!(
            target: "pulse::engine",
            duration_ms = started.elapsed().as_millis() as u64,
            "Engine shutdown complete"
        );
    }

    pub fn stats(&self) -> EngineStats {
        let metrics = self.pipeline.metrics();
        EngineStats {
            uptime: self.uptime(),
            is_running: self.is_running(),
            points_ingested: metrics.points_ingested.get(),
            points_rejected: metrics.points_rejected.get(),
            alerts_retained: self.pipeline.alerts().len(),
            live_series: self.pipeline.window().series_count(),
            hub: self.pipeline.hub().stats(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineStats {
    pub uptime: Duration,
    pub is_running: bool,
    pub points_ingested: u64,
    pub points_rejected: u64,
    pub alerts_retained: usize,
    pub live_series: usize,
    pub hub: HubStats,
}

fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    error!(target: "pulse::engine", error = %e, "Failed to install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = token.cancelled() => return,
                _ = sigterm.recv() => info!(target: "pulse::engine", "Received SIGTERM"),
                result = tokio::signal::ctrl_c() => match result {
                    Ok(()) => info!(target: "pulse::engine", "Received SIGINT"),
                    Err(e) => {
                        error!(target: "pulse::engine", error = %e, "Failed to listen for SIGINT");
                        return;
                    }
                },
            }
        }
        #[cfg(not(unix))]
        {
            tokio::select! {
                _ = token.cancelled() => return,
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        error!(target: "pulse::engine", error = %e, "Failed to listen for Ctrl-C");
                        return;
                    }
                    info!(target: "pulse::engine", "Received Ctrl-C");
                }
            }
        }
        token.cancel();
    });
}
