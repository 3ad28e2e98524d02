//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Buffered bulk ingestion and measurement storage."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use wattline_common::config::WriterConfig;
use wattline_schema::Measurement;

use crate::store::MeasurementStore;
use crate::{IngestMetrics, PersistenceError, Result};

/// Point-in-time view of the writer queue for supervisors and snapshots.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct QueueStats {
    /// Measurements currently buffered.
    pub buffered: usize,
    /// Configured capacity trigger.
    pub max_buffer_size: usize,
    /// Configured minimum batch for periodic flushes.
    pub min_batch_size: usize,
}

enum Command {
    Enqueue(Vec<Measurement>),
    Flush(oneshot::Sender<Result<u64>>),
    Shutdown(oneshot::Sender<Result<u64>>),
}

/// Handle to the buffered bulk writer.
///
/// A single control loop owns the buffer and is the only writer to storage:
/// producers hand measurements over an unbounded channel and never block,
/// and flushes are serialized by construction — a flush signal arriving
/// while one is in flight simply runs afterwards over whatever remains.
///
/// Delivery is at-least-once: a failed flush puts the entire batch back at
/// the head of the buffer, so a transaction that was partially applied
/// before the failure report is duplicated when retried. The buffer is
/// unbounded; under sustained storage failure it grows until an external
/// supervisor intervenes, which is what [`BulkWriter::queue_stats`] exists
/// for.
#[derive(Clone)]
pub struct BulkWriter {
    tx: mpsc::UnboundedSender<Command>,
    depth: Arc<AtomicUsize>,
    config: WriterConfig,
}

impl BulkWriter {
    /// Spawn the control loop against a store.
    pub fn spawn(
        store: Arc<dyn MeasurementStore>,
        config: WriterConfig,
        metrics: Option<IngestMetrics>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        let loop_config = config.clone();
        let loop_depth = depth.clone();
        tokio::spawn(async move {
            run_control_loop(rx, store, loop_config, loop_depth, metrics).await;
        });
        Self { tx, depth, config }
    }

    /// Hand a reading's measurements to the writer. Never blocks.
    pub fn enqueue(&self, measurements: Vec<Measurement>) -> Result<()> {
        if measurements.is_empty() {
            return Ok(());
        }
        self.tx
            .send(Command::Enqueue(measurements))
            .map_err(|_| PersistenceError::WriterStopped)
    }

    /// Flush unconditionally and wait for the outcome.
    pub async fn flush(&self) -> Result<u64> {
        let (reply, outcome) = oneshot::channel();
        self.tx
            .send(Command::Flush(reply))
            .map_err(|_| PersistenceError::WriterStopped)?;
        outcome.await.map_err(|_| PersistenceError::WriterStopped)?
    }

    /// Final drain with a bounded wait. When the bound elapses the caller
    /// proceeds and the still-buffered tail is lost with the process.
    pub async fn shutdown(&self, wait: Duration) -> Result<u64> {
        let (reply, outcome) = oneshot::channel();
        self.tx
            .send(Command::Shutdown(reply))
            .map_err(|_| PersistenceError::WriterStopped)?;
        match tokio::time::timeout(wait, outcome).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PersistenceError::WriterStopped),
            Err(_) => {
                warn!(
                    wait_ms = wait.as_millis() as u64,
                    buffered = self.buffered(),
                    "shutdown flush did not finish in time; proceeding"
                );
                Err(PersistenceError::Timeout(wait))
            }
        }
    }

    /// Measurements currently buffered.
    pub fn buffered(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Queue view for the metrics snapshot.
    pub fn queue_stats(&self) -> QueueStats {
        QueueStats {
            buffered: self.buffered(),
            max_buffer_size: self.config.max_buffer_size,
            min_batch_size: self.config.min_batch_size,
        }
    }
}

async fn run_control_loop(
    mut rx: mpsc::UnboundedReceiver<Command>,
    store: Arc<dyn MeasurementStore>,
    config: WriterConfig,
    depth: Arc<AtomicUsize>,
    metrics: Option<IngestMetrics>,
) {
    let mut buffer: Vec<Measurement> = Vec::new();
    let mut ticker = tokio::time::interval(config.flush_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        max_buffer_size = config.max_buffer_size,
        min_batch_size = config.min_batch_size,
        flush_interval_ms = config.flush_interval_ms,
        "bulk writer started"
    );

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Enqueue(mut measurements)) => {
                    buffer.append(&mut measurements);
                    track_depth(&depth, &metrics, buffer.len());
                    if buffer.len() >= config.max_buffer_size {
                        debug!(buffered = buffer.len(), "buffer reached capacity; flushing");
                        let _ = flush_buffer(&store, &mut buffer, &depth, &metrics).await;
                    }
                }
                Some(Command::Flush(reply)) => {
                    let outcome = flush_buffer(&store, &mut buffer, &depth, &metrics).await;
                    let _ = reply.send(outcome);
                }
                Some(Command::Shutdown(reply)) => {
                    let outcome = flush_buffer(&store, &mut buffer, &depth, &metrics).await;
                    let _ = reply.send(outcome);
                    break;
                }
                None => {
                    if let Err(err) = flush_buffer(&store, &mut buffer, &depth, &metrics).await {
                        error!(error = %err, buffered = buffer.len(), "final flush failed; tail lost");
                    }
                    break;
                }
            },
            _ = ticker.tick() => {
                if buffer.len() >= config.min_batch_size {
                    let _ = flush_buffer(&store, &mut buffer, &depth, &metrics).await;
                }
            }
        }
    }
    info!("bulk writer stopped");
}

/// Swap the buffer out, write it as one transaction, and restore it whole
/// on failure. Items enqueued while the write is in flight are still in the
/// channel and land behind the requeued batch, so order is preserved.
async fn flush_buffer(
    store: &Arc<dyn MeasurementStore>,
    buffer: &mut Vec<Measurement>,
    depth: &Arc<AtomicUsize>,
    metrics: &Option<IngestMetrics>,
) -> Result<u64> {
    if buffer.is_empty() {
        return Ok(0);
    }
    let batch = std::mem::take(buffer);
    track_depth(depth, metrics, 0);

    let started = Instant::now();
    match store.insert_batch(&batch).await {
        Ok(rows) => {
            let elapsed = started.elapsed();
            debug!(rows, elapsed_ms = elapsed.as_millis() as u64, "flushed measurement batch");
            if let Some(metrics) = metrics {
                metrics.record_flush_ok(rows, elapsed.as_secs_f64());
            }
            Ok(rows)
        }
        Err(err) => {
            let elapsed = started.elapsed();
            error!(
                error = %err,
                requeued = batch.len(),
                "flush failed; batch returned to buffer"
            );
            if let Some(metrics) = metrics {
                metrics.record_flush_error(batch.len() as u64, elapsed.as_secs_f64());
            }
            *buffer = batch;
            track_depth(depth, metrics, buffer.len());
            Err(err)
        }
    }
}

fn track_depth(depth: &Arc<AtomicUsize>, metrics: &Option<IngestMetrics>, len: usize) {
    depth.store(len, Ordering::Relaxed);
    if let Some(metrics) = metrics {
        metrics.set_buffer_depth(len);
    }
}
