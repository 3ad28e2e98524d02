//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Buffered bulk ingestion and measurement storage."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

use crate::Result;

/// Metrics published by the bulk ingestion path.
#[derive(Clone)]
pub struct IngestMetrics {
    flushes: IntCounterVec,
    flush_duration: Histogram,
    rows_written: IntCounter,
    rows_requeued: IntCounter,
    buffer_depth: IntGauge,
    #[allow(dead_code)]
    registry: Arc<Registry>,
}

impl IngestMetrics {
    /// Register all ingest metrics with the provided registry.
    pub fn new(registry: Arc<Registry>) -> Result<Self> {
        let flushes = IntCounterVec::new(
            Opts::new(
                "wattline_ingest_flushes_total",
                "Flush attempts by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(flushes.clone()))?;

        let flush_duration = Histogram::with_opts(
            HistogramOpts::new(
                "wattline_ingest_flush_duration_seconds",
                "Duration of bulk-insert flushes",
            )
            .buckets(prometheus::exponential_buckets(0.001, 2.0, 14)?),
        )?;
        registry.register(Box::new(flush_duration.clone()))?;

        let rows_written = IntCounter::with_opts(Opts::new(
            "wattline_ingest_rows_written_total",
            "Measurements durably written to storage",
        ))?;
        registry.register(Box::new(rows_written.clone()))?;

        let rows_requeued = IntCounter::with_opts(Opts::new(
            "wattline_ingest_rows_requeued_total",
            "Measurements returned to the buffer after a failed flush",
        ))?;
        registry.register(Box::new(rows_requeued.clone()))?;

        let buffer_depth = IntGauge::with_opts(Opts::new(
            "wattline_ingest_buffer_depth",
            "Measurements currently buffered for ingestion",
        ))?;
        registry.register(Box::new(buffer_depth.clone()))?;

        Ok(Self {
            flushes,
            flush_duration,
            rows_written,
            rows_requeued,
            buffer_depth,
            registry,
        })
    }

    /// Record a committed flush.
    pub fn record_flush_ok(&self, rows: u64, seconds: f64) {
        self.flushes.with_label_values(&["ok"]).inc();
        self.flush_duration.observe(seconds);
        self.rows_written.inc_by(rows);
    }

    /// Record a failed flush and the batch that went back to the buffer.
    pub fn record_flush_error(&self, requeued: u64, seconds: f64) {
        self.flushes.with_label_values(&["error"]).inc();
        self.flush_duration.observe(seconds);
        self.rows_requeued.inc_by(requeued);
    }

    /// Track the current buffer depth.
    pub fn set_buffer_depth(&self, depth: usize) {
        self.buffer_depth.set(depth as i64);
    }
}

impl std::fmt::Debug for IngestMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestMetrics").finish_non_exhaustive()
    }
}
