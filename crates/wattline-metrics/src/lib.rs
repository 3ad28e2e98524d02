//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Metrics collection and export utilities."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub mod collector;

pub use collector::{
    AcquisitionCollector, AcquisitionSnapshot, DeviceSnapshot, QueueSnapshot, ThroughputSnapshot,
};

/// Shared registry type used across services.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;
    let bound = listener
        .local_addr()
        .with_context(|| "failed to resolve bound metrics address")?;

    info!(address = %bound, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

/// Prometheus scrape endpoint. Returns `text/plain` metrics even on large registries.
async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_str(encoder.format_type())
                    .expect("prometheus format_type is a valid header value"),
            )],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                String::from("metrics encoding error"),
            )
                .into_response()
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Return the bound address for convenience.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Prometheus counters recorded by the acquisition scheduler.
#[derive(Clone)]
pub struct PollerMetrics {
    registry: SharedRegistry,
    polls: IntCounterVec,
    poll_duration: Histogram,
}

impl PollerMetrics {
    /// Register scheduler metrics with the provided registry.
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let polls = IntCounterVec::new(
            Opts::new(
                "wattline_polls_total",
                "Device poll cycles by outcome (ok, error, skipped)",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(polls.clone()))?;

        let buckets = prometheus::exponential_buckets(0.005, 2.0, 12)
            .context("failed to construct histogram buckets")?;
        let poll_duration = Histogram::with_opts(
            HistogramOpts::new(
                "wattline_poll_duration_seconds",
                "Wall-clock duration of completed device poll cycles",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(poll_duration.clone()))?;

        Ok(Self {
            registry,
            polls,
            poll_duration,
        })
    }

    /// Access the backing registry.
    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    /// Record one completed or skipped cycle.
    pub fn record_poll(&self, outcome: &str, seconds: Option<f64>) {
        self.polls.with_label_values(&[outcome]).inc();
        if let Some(seconds) = seconds {
            self.poll_duration.observe(seconds);
        }
    }
}

impl std::fmt::Debug for PollerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollerMetrics").finish_non_exhaustive()
    }
}

pub use prometheus;
