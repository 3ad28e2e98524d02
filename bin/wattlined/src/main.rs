//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the Wattline daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use wattline_common::config::AppConfig;
use wattline_common::logging::init_tracing;
use wattline_core::{queue_snapshot, AcquisitionScheduler, DeviceReader};
use wattline_metrics::{new_registry, spawn_http_server, AcquisitionCollector, PollerMetrics};
use wattline_net::{SnmpProtocolClient, WebMiClient};
use wattline_persistence::{
    BulkWriter, IngestMetrics, MeasurementStore, MemoryMeasurementStore, PgMeasurementStore,
};
use wattline_resilience::BreakerRegistry;
use wattline_schema::InMemoryDeviceRegistry;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Wattline acquisition daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the acquisition pipeline")]
    Run,
    #[command(about = "Load and validate the configuration, then exit")]
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/wattline.toml"));
    candidates.push(PathBuf::from("configs/example.dev.toml"));

    let config = AppConfig::load(&candidates)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(config).await,
        Commands::CheckConfig => {
            println!("configuration ok: {} device(s)", config.devices.len());
            Ok(())
        }
    }
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    init_tracing("wattlined", &config.logging)?;

    let registry = Arc::new(InMemoryDeviceRegistry::new());
    for entry in &config.devices {
        let (device, mappings) = entry.into_model(config.acquisition.default_poll_interval_ms);
        registry.set_mappings(device.device_id, mappings);
        registry.upsert_device(device);
    }
    info!(devices = config.devices.len(), "device registry initialised");

    let metrics_registry = new_registry();
    let ingest_metrics = IngestMetrics::new(metrics_registry.clone())?;
    let poller_metrics = PollerMetrics::new(metrics_registry.clone())?;
    let metrics_server = if config.metrics.enabled {
        Some(spawn_http_server(metrics_registry.clone(), config.metrics.listen)?)
    } else {
        None
    };

    let store: Arc<dyn MeasurementStore> = if config.storage.database_url.is_empty() {
        warn!("storage.database_url is empty; measurements stay in memory");
        Arc::new(MemoryMeasurementStore::new())
    } else {
        Arc::new(
            PgMeasurementStore::connect(&config.storage)
                .await
                .context("failed to connect measurement store")?,
        )
    };
    let writer = BulkWriter::spawn(store, config.writer.clone(), Some(ingest_metrics));

    let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
    let reader = Arc::new(
        DeviceReader::new(registry.clone(), breakers)
            .with_client(Arc::new(WebMiClient::new(config.protocol.clone())?))
            .with_client(Arc::new(SnmpProtocolClient::new(&config.protocol))),
    );
    let collector = Arc::new(AcquisitionCollector::new());

    let scheduler = AcquisitionScheduler::new(
        registry,
        reader,
        writer.clone(),
        collector.clone(),
        Some(poller_metrics),
        config.acquisition.clone(),
    );
    let handle = scheduler.start();
    info!("wattline daemon running; ctrl-c to stop");

    signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutdown signal received");

    handle.shutdown().await;

    let snapshot = collector.snapshot(queue_snapshot(&writer));
    info!(
        buffered = snapshot.queue.buffered,
        points_per_second = snapshot.throughput.points_per_second,
        "final acquisition snapshot"
    );

    if let Err(err) = writer.shutdown(config.writer.shutdown_flush_wait()).await {
        warn!(error = %err, "final flush incomplete; buffered tail lost");
    }
    if let Some(server) = metrics_server {
        if let Err(err) = server.shutdown().await {
            warn!(error = %err, "metrics server shutdown error");
        }
    }
    info!("wattline daemon stopped");
    Ok(())
}
