// ============================================================================
// COMMAND-LINE ENTRY POINT
// ============================================================================
// `pulse` command-line entry point.
// ============================================================================

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result as AnyhowResult};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pulse_engine::client::StreamClient;
use pulse_engine::logging::init_logging;
use pulse_engine::types::StreamEvent;
use pulse_engine::{Engine, EngineConfig, DEFAULT_STREAM_URL, ENGINE_FULL_NAME, ENGINE_VERSION};

/// Pulse telemetry engine
#[derive(Parser, Debug)]
#[command(
    name = "pulse",
    author = "AIOps Team",
    version,
    about = "Live telemetry ingestion, anomaly detection and streaming",
    long_about = "Pulse ingests service metrics over HTTP, keeps a live window per series, \
                  raises threshold alerts, serves percentile rollups and streams every \
                  point and alert to WebSocket subscribers."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "pulse.toml", env = "PULSE_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "PULSE_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Shorthand for `--log-level debug`
    #[arg(short, long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the engine (default)
    Run,

    /// Validate configuration file
    Validate {
        /// Print the fully resolved configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version and build info
    Version,

    /// Print events from a running engine's stream
    Watch {
        #[arg(short, long, default_value = DEFAULT_STREAM_URL)]
        url: String,

        /// Only print alerts
        #[arg(long)]
        alerts_only: bool,
    },
}

fn handle_validate(config_path: &Path, verbose: bool) -> AnyhowResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    let config = EngineConfig::load(config_path)
        .with_context(|| format!("Configuration in {} is invalid", config_path.display()))?;
    println!("Configuration is valid");

    if verbose {
        println!();
        println!("{}", "=".repeat(60));
        println!("{}", toml::to_string_pretty(&config).context("Failed to render configuration")?);
    }

    println!();
    println!("Summary:");
    println!("  Instance name:    {}", config.engine.instance_name);
    println!("  Bind address:     {}", config.server.bind_addr);
    println!("  Storage backend:  {:?}", config.storage.backend);
    println!("  Raw retention:    {:?}", config.retention.raw_retention);
    println!("  Rollup retention: {:?}", config.retention.aggregate_retention);
    println!("  Live window:      {} points/series", config.buffer.capacity);
    println!(
        "  Simulator:        {}",
        if config.simulator.enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

fn handle_generate_config(output: Option<&Path>) -> AnyhowResult<()> {
    let config_str = EngineConfig::generate_default_config();
    match output {
        Some(path) => {
            fs::write(path, &config_str)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Default configuration written to: {}", path.display());
        }
        None => println!("{config_str}"),
    }
    Ok(())
}

fn handle_version() {
    println!("{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    println!();
    println!("Build Information:");
    println!("  Target: {}", std::env::consts::ARCH);
    println!("  OS:     {}", std::env::consts::OS);
}

async fn handle_watch(url: String, alerts_only: bool) -> AnyhowResult<()> {
    let token = CancellationToken::new();
    let ctrl_c = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    StreamClient::new(url)
        .run(token, move |event| match &event {
            StreamEvent::Alert(alert) => println!(
                "[{}] {} {} {}={} ({})",
                alert.timestamp, alert.severity.as_str(), alert.service, alert.metric_type,
                alert.value, alert.message
            ),
            StreamEvent::Metric(point) if !alerts_only => println!(
                "[{}] {} {}={}",
                point.timestamp, point.service, point.metric_type, point.value
            ),
            StreamEvent::Initial(points) if !alerts_only => {
                println!("initial snapshot: {} points", points.len())
            }
            _ => {}
        })
        .await;
    Ok(())
}

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => return handle_generate_config(output.as_deref()),
        Some(Commands::Validate { verbose }) => return handle_validate(&cli.config, *verbose),
        _ => {}
    }

    let config_found = cli.config.exists();
    let config = if config_found {
        EngineConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        EngineConfig::from_env().context("Invalid configuration in environment")?
    };

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    init_logging(&logging_config).context("Failed to initialize logging")?;

    if !config_found {
        warn!("Config file not found at {}, using defaults", cli.config.display());
    }
    info!("{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);

    match cli.command {
        Some(Commands::Watch { url, alerts_only }) => handle_watch(url, alerts_only).await,
        _ => {
            let engine = Engine::new(config).context("Failed to start engine")?;
            engine.run().await.context("Engine stopped with an error")?;
            Ok(())
        }
    }
}
