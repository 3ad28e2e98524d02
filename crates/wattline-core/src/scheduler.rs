//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Device reading and acquisition scheduling."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};
use wattline_common::config::AcquisitionConfig;
use wattline_metrics::{AcquisitionCollector, PollerMetrics, QueueSnapshot};
use wattline_persistence::BulkWriter;
use wattline_schema::{Device, DeviceRegistry};

use crate::reader::DeviceReader;

/// Drives one independent polling cadence per enabled device.
///
/// Every enabled device gets its own tokio task restarted on a fixed
/// interval, so a slow or unreachable device never delays the others, and
/// a device's cycles never overlap — a cycle that overruns its interval
/// just starts the next one immediately after. A supervisor task re-reads
/// the enabled set periodically to pick up added devices; a poll task ends
/// itself when its device disappears or is disabled.
pub struct AcquisitionScheduler {
    registry: Arc<dyn DeviceRegistry>,
    reader: Arc<DeviceReader>,
    writer: BulkWriter,
    collector: Arc<AcquisitionCollector>,
    poller_metrics: Option<PollerMetrics>,
    config: AcquisitionConfig,
}

/// Handle used to stop the scheduler and all poll tasks.
pub struct SchedulerHandle {
    shutdown: broadcast::Sender<()>,
    supervisor: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop the supervisor and every poll task, cancelling in-flight reads.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(err) = self.supervisor.await {
            warn!(error = %err, "scheduler supervisor join error");
        }
        info!("acquisition scheduler stopped");
    }
}

impl AcquisitionScheduler {
    /// Assemble a scheduler over the given collaborators.
    pub fn new(
        registry: Arc<dyn DeviceRegistry>,
        reader: Arc<DeviceReader>,
        writer: BulkWriter,
        collector: Arc<AcquisitionCollector>,
        poller_metrics: Option<PollerMetrics>,
        config: AcquisitionConfig,
    ) -> Self {
        Self {
            registry,
            reader,
            writer,
            collector,
            poller_metrics,
            config,
        }
    }

    /// Spawn the supervisor and return the lifecycle handle.
    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(16);
        let supervisor = tokio::spawn(run_supervisor(
            self.registry,
            self.reader,
            self.writer,
            self.collector,
            self.poller_metrics,
            self.config,
            shutdown_rx,
        ));
        SchedulerHandle {
            shutdown: shutdown_tx,
            supervisor,
        }
    }
}

/// Queue view for the metrics snapshot, taken from the writer.
pub fn queue_snapshot(writer: &BulkWriter) -> QueueSnapshot {
    let stats = writer.queue_stats();
    QueueSnapshot {
        buffered: stats.buffered,
        max_buffer_size: stats.max_buffer_size,
        min_batch_size: stats.min_batch_size,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_supervisor(
    registry: Arc<dyn DeviceRegistry>,
    reader: Arc<DeviceReader>,
    writer: BulkWriter,
    collector: Arc<AcquisitionCollector>,
    poller_metrics: Option<PollerMetrics>,
    config: AcquisitionConfig,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut tasks: HashMap<i32, JoinHandle<()>> = HashMap::new();
    let poll_shutdown = shutdown.resubscribe();
    info!(
        refresh_interval_ms = config.refresh_interval_ms,
        "acquisition scheduler started"
    );

    loop {
        tasks.retain(|device_id, handle| {
            if handle.is_finished() {
                debug!(device_id, "poll task finished; eligible for respawn");
                false
            } else {
                true
            }
        });

        match registry.enabled_devices().await {
            Ok(devices) => {
                for device in devices {
                    let device_id = device.device_id;
                    if tasks.contains_key(&device_id) {
                        continue;
                    }
                    info!(
                        device_id,
                        name = %device.display_name(),
                        protocol = %device.protocol,
                        interval_ms = device.poll_interval_ms,
                        "starting poll task"
                    );
                    let handle = tokio::spawn(run_device_task(
                        device,
                        registry.clone(),
                        reader.clone(),
                        writer.clone(),
                        collector.clone(),
                        poller_metrics.clone(),
                        config.start_jitter_pct,
                        poll_shutdown.resubscribe(),
                    ));
                    tasks.insert(device_id, handle);
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to refresh enabled devices");
            }
        }

        tokio::select! {
            _ = shutdown.recv() => break,
            _ = sleep(config.refresh_interval()) => {}
        }
    }

    for (device_id, handle) in tasks {
        if !handle.is_finished() {
            debug!(device_id, "waiting for poll task to stop");
        }
        let _ = handle.await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_device_task(
    mut device: Device,
    registry: Arc<dyn DeviceRegistry>,
    reader: Arc<DeviceReader>,
    writer: BulkWriter,
    collector: Arc<AcquisitionCollector>,
    poller_metrics: Option<PollerMetrics>,
    start_jitter_pct: f64,
    mut shutdown: broadcast::Receiver<()>,
) {
    // Randomized start offset so device phases do not align.
    let jitter = start_jitter(device.poll_interval(), start_jitter_pct);
    if !jitter.is_zero() {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = sleep(jitter) => {}
        }
    }

    let mut interval_ms = device.poll_interval_ms;
    let mut ticker = interval(device.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                debug!(device_id = device.device_id, "poll task shutdown");
                break;
            }
            _ = ticker.tick() => {
                // The device row is re-read once per cycle; registry owns it.
                match registry.device(device.device_id).await {
                    Ok(Some(row)) if row.enabled => device = row,
                    Ok(_) => {
                        info!(device_id = device.device_id, "device disabled or removed; stopping poll task");
                        break;
                    }
                    Err(err) => {
                        warn!(device_id = device.device_id, error = %err, "device refresh failed; keeping previous row");
                    }
                }
                if device.poll_interval_ms != interval_ms {
                    info!(
                        device_id = device.device_id,
                        from_ms = interval_ms,
                        to_ms = device.poll_interval_ms,
                        "poll interval changed; rebuilding ticker"
                    );
                    interval_ms = device.poll_interval_ms;
                    ticker = interval(device.poll_interval());
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                }
                poll_once(
                    &device,
                    &registry,
                    &reader,
                    &writer,
                    &collector,
                    poller_metrics.as_ref(),
                )
                .await;
            }
        }
    }
}

async fn poll_once(
    device: &Device,
    registry: &Arc<dyn DeviceRegistry>,
    reader: &Arc<DeviceReader>,
    writer: &BulkWriter,
    collector: &Arc<AcquisitionCollector>,
    poller_metrics: Option<&PollerMetrics>,
) {
    let reading = reader.read(device).await;
    let breaker = reader.breakers().handle(device.device_id);
    collector.record_breaker_state(device.device_id, &device.name, &breaker.state().to_string());

    if reading.skipped {
        if let Some(metrics) = poller_metrics {
            metrics.record_poll("skipped", None);
        }
        return;
    }

    let seconds = reading.poll_duration.as_secs_f64();
    if reading.success {
        let points = reading.measurements.len();
        if points > 0 {
            collector.record_points(points as u64);
            if let Err(err) = writer.enqueue(reading.measurements) {
                warn!(device_id = device.device_id, error = %err, "failed to enqueue measurements");
            }
        }
        if let Err(err) = registry.update_last_seen(device.device_id, reading.utc_ts).await {
            warn!(device_id = device.device_id, error = %err, "failed to update last-seen");
        }
        collector.record_success(device.device_id, &device.name, reading.poll_duration);
        if let Some(metrics) = poller_metrics {
            metrics.record_poll("ok", Some(seconds));
        }
        debug!(
            device_id = device.device_id,
            points,
            duration_ms = reading.poll_duration.as_millis() as u64,
            "poll cycle complete"
        );
    } else {
        collector.record_failure(device.device_id, &device.name);
        if let Some(metrics) = poller_metrics {
            metrics.record_poll("error", Some(seconds));
        }
        warn!(
            device_id = device.device_id,
            error = reading.error_message.as_deref().unwrap_or("unknown"),
            "poll cycle failed"
        );
    }
}

/// Random fraction of the interval used to offset a task's first cycle.
fn start_jitter(interval: Duration, jitter_pct: f64) -> Duration {
    if jitter_pct <= 0.0 {
        return Duration::ZERO;
    }
    let max_ms = (interval.as_millis() as f64 * jitter_pct) as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_is_bounded_by_the_configured_fraction() {
        let interval = Duration::from_millis(1000);
        for _ in 0..100 {
            let jitter = start_jitter(interval, 0.1);
            assert!(jitter <= Duration::from_millis(100));
        }
        assert_eq!(start_jitter(interval, 0.0), Duration::ZERO);
    }
}
