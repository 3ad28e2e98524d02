//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Metrics collection and export utilities."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

/// Sliding window over which points/second is computed.
const THROUGHPUT_WINDOW: Duration = Duration::from_secs(60);

/// Latency samples retained for percentile computation.
const LATENCY_SAMPLE_CAP: usize = 1000;

/// Point-in-time view of the whole acquisition pipeline.
///
/// This is the JSON surface the external health collaborator consumes.
#[derive(Debug, Clone, Serialize)]
pub struct AcquisitionSnapshot {
    /// When the snapshot was assembled.
    pub timestamp: DateTime<Utc>,
    /// Global throughput and latency view.
    pub throughput: ThroughputSnapshot,
    /// Per-device health, ordered by device id.
    pub devices: Vec<DeviceSnapshot>,
    /// Writer queue occupancy.
    pub queue: QueueSnapshot,
}

/// Global throughput and latency percentiles.
#[derive(Debug, Clone, Serialize)]
pub struct ThroughputSnapshot {
    /// Measurements ingested per second over the sliding window.
    pub points_per_second: f64,
    /// Mean of the retained poll-duration samples, milliseconds.
    pub avg_poll_duration_ms: f64,
    /// 95th percentile poll duration, milliseconds.
    pub p95_latency_ms: f64,
    /// 99th percentile poll duration, milliseconds.
    pub p99_latency_ms: f64,
}

/// Per-device acquisition health.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    /// Registry identity.
    pub device_id: i32,
    /// Device name as last reported.
    pub name: String,
    /// Completion time of the most recent successful poll.
    pub last_poll_utc: Option<DateTime<Utc>>,
    /// Duration of the most recent successful poll, milliseconds.
    pub last_poll_duration_ms: f64,
    /// Cumulative failed cycles.
    pub error_count: u64,
    /// Circuit breaker state as last reported.
    pub breaker_state: String,
    /// Successful cycles over attempted cycles, 0..=1.
    pub success_rate: f64,
}

/// Writer queue occupancy against its configured bounds.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueSnapshot {
    /// Measurements currently buffered.
    pub buffered: usize,
    /// Configured capacity trigger.
    pub max_buffer_size: usize,
    /// Configured minimum batch for periodic flushes.
    pub min_batch_size: usize,
}

#[derive(Debug, Default)]
struct DeviceStats {
    name: Mutex<String>,
    last_poll_epoch_ms: AtomicI64,
    last_duration_us: AtomicU64,
    error_count: AtomicU64,
    successes: AtomicU64,
    attempts: AtomicU64,
    breaker_state: Mutex<String>,
}

/// Concurrent-safe aggregation of acquisition outcomes.
///
/// Every field is updated independently — poll tasks touch atomics or a
/// per-device entry, never a collector-wide lock — so recording cannot
/// serialize the poll loop. A snapshot may therefore observe a mix of
/// in-progress updates across different metrics; each individual metric is
/// consistent.
#[derive(Debug)]
pub struct AcquisitionCollector {
    points_total: AtomicU64,
    throughput_samples: Mutex<VecDeque<(Instant, u64)>>,
    latencies_ms: Mutex<VecDeque<f64>>,
    devices: RwLock<HashMap<i32, Arc<DeviceStats>>>,
}

impl Default for AcquisitionCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl AcquisitionCollector {
    /// Empty collector. The throughput window is anchored at creation so
    /// the first snapshot already has an elapsed interval to rate over.
    pub fn new() -> Self {
        let mut samples = VecDeque::new();
        samples.push_back((Instant::now(), 0u64));
        Self {
            points_total: AtomicU64::new(0),
            throughput_samples: Mutex::new(samples),
            latencies_ms: Mutex::new(VecDeque::new()),
            devices: RwLock::new(HashMap::new()),
        }
    }

    fn stats(&self, device_id: i32, name: &str) -> Arc<DeviceStats> {
        if let Some(stats) = self.devices.read().get(&device_id) {
            return stats.clone();
        }
        let stats = self
            .devices
            .write()
            .entry(device_id)
            .or_insert_with(|| Arc::new(DeviceStats::default()))
            .clone();
        *stats.name.lock() = name.to_owned();
        stats
    }

    /// Record a successful poll cycle and its duration.
    pub fn record_success(&self, device_id: i32, name: &str, duration: Duration) {
        let stats = self.stats(device_id, name);
        stats.attempts.fetch_add(1, Ordering::Relaxed);
        stats.successes.fetch_add(1, Ordering::Relaxed);
        stats
            .last_poll_epoch_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        stats
            .last_duration_us
            .store(duration.as_micros() as u64, Ordering::Relaxed);

        let millis = duration.as_secs_f64() * 1000.0;
        let mut latencies = self.latencies_ms.lock();
        latencies.push_back(millis);
        while latencies.len() > LATENCY_SAMPLE_CAP {
            latencies.pop_front();
        }
    }

    /// Record a failed poll cycle.
    pub fn record_failure(&self, device_id: i32, name: &str) {
        let stats = self.stats(device_id, name);
        stats.attempts.fetch_add(1, Ordering::Relaxed);
        stats.error_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record measurements handed to the writer.
    pub fn record_points(&self, count: u64) {
        self.points_total.fetch_add(count, Ordering::Relaxed);
    }

    /// Record the breaker state observed for a device this cycle.
    pub fn record_breaker_state(&self, device_id: i32, name: &str, state: &str) {
        let stats = self.stats(device_id, name);
        *stats.breaker_state.lock() = state.to_owned();
    }

    /// Points per second over the sliding window, sampled now.
    pub fn points_per_second(&self) -> f64 {
        let total = self.points_total.load(Ordering::Relaxed);
        let now = Instant::now();
        let mut samples = self.throughput_samples.lock();
        samples.push_back((now, total));
        while let Some(&(at, _)) = samples.front() {
            if now.duration_since(at) > THROUGHPUT_WINDOW && samples.len() > 1 {
                samples.pop_front();
            } else {
                break;
            }
        }
        let Some(&(oldest_at, oldest_total)) = samples.front() else {
            return 0.0;
        };
        let elapsed = now.duration_since(oldest_at).as_secs_f64();
        if elapsed <= f64::EPSILON {
            return 0.0;
        }
        (total.saturating_sub(oldest_total)) as f64 / elapsed
    }

    /// Assemble a point-in-time snapshot.
    pub fn snapshot(&self, queue: QueueSnapshot) -> AcquisitionSnapshot {
        let (avg, p95, p99) = {
            let latencies = self.latencies_ms.lock();
            if latencies.is_empty() {
                (0.0, 0.0, 0.0)
            } else {
                let mut sorted: Vec<f64> = latencies.iter().copied().collect();
                sorted.sort_by(|a, b| a.partial_cmp(b).expect("latency samples are finite"));
                let avg = sorted.iter().sum::<f64>() / sorted.len() as f64;
                (avg, percentile(&sorted, 0.95), percentile(&sorted, 0.99))
            }
        };

        let devices_guard = self.devices.read();
        let mut devices: Vec<DeviceSnapshot> = devices_guard
            .iter()
            .map(|(device_id, stats)| {
                let attempts = stats.attempts.load(Ordering::Relaxed);
                let successes = stats.successes.load(Ordering::Relaxed);
                let epoch_ms = stats.last_poll_epoch_ms.load(Ordering::Relaxed);
                DeviceSnapshot {
                    device_id: *device_id,
                    name: stats.name.lock().clone(),
                    last_poll_utc: (epoch_ms > 0)
                        .then(|| Utc.timestamp_millis_opt(epoch_ms).single())
                        .flatten(),
                    last_poll_duration_ms: stats.last_duration_us.load(Ordering::Relaxed) as f64
                        / 1000.0,
                    error_count: stats.error_count.load(Ordering::Relaxed),
                    breaker_state: stats.breaker_state.lock().clone(),
                    success_rate: if attempts > 0 {
                        successes as f64 / attempts as f64
                    } else {
                        0.0
                    },
                }
            })
            .collect();
        drop(devices_guard);
        devices.sort_by_key(|device| device.device_id);

        AcquisitionSnapshot {
            timestamp: Utc::now(),
            throughput: ThroughputSnapshot {
                points_per_second: self.points_per_second(),
                avg_poll_duration_ms: avg,
                p95_latency_ms: p95,
                p99_latency_ms: p99,
            },
            devices,
            queue,
        }
    }
}

/// Nearest-rank percentile over an ascending slice.
fn percentile(sorted: &[f64], fraction: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let index = (fraction * (sorted.len() - 1) as f64).round() as usize;
    sorted[index.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> QueueSnapshot {
        QueueSnapshot {
            buffered: 3,
            max_buffer_size: 1000,
            min_batch_size: 10,
        }
    }

    #[test]
    fn success_and_failure_counts_feed_the_success_rate() {
        let collector = AcquisitionCollector::new();
        collector.record_success(1, "tgbt-a", Duration::from_millis(20));
        collector.record_success(1, "tgbt-a", Duration::from_millis(30));
        collector.record_failure(1, "tgbt-a");

        let snapshot = collector.snapshot(queue());
        assert_eq!(snapshot.devices.len(), 1);
        let device = &snapshot.devices[0];
        assert_eq!(device.device_id, 1);
        assert_eq!(device.error_count, 1);
        assert!((device.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!(device.last_poll_utc.is_some());
        assert_eq!(device.last_poll_duration_ms, 30.0);
    }

    #[test]
    fn devices_that_only_failed_have_no_last_poll() {
        let collector = AcquisitionCollector::new();
        collector.record_failure(2, "tgbt-b");

        let snapshot = collector.snapshot(queue());
        let device = &snapshot.devices[0];
        assert_eq!(device.success_rate, 0.0);
        assert!(device.last_poll_utc.is_none());
    }

    #[test]
    fn percentiles_track_the_latency_samples() {
        let collector = AcquisitionCollector::new();
        for ms in 1..=100u64 {
            collector.record_success(1, "tgbt-a", Duration::from_millis(ms));
        }

        let snapshot = collector.snapshot(queue());
        assert!((snapshot.throughput.avg_poll_duration_ms - 50.5).abs() < 1e-9);
        assert_eq!(snapshot.throughput.p95_latency_ms, 95.0);
        assert_eq!(snapshot.throughput.p99_latency_ms, 99.0);
    }

    #[test]
    fn latency_window_is_bounded() {
        let collector = AcquisitionCollector::new();
        for _ in 0..(LATENCY_SAMPLE_CAP + 500) {
            collector.record_success(1, "tgbt-a", Duration::from_millis(10));
        }
        assert_eq!(collector.latencies_ms.lock().len(), LATENCY_SAMPLE_CAP);
    }

    #[test]
    fn points_per_second_uses_the_sliding_window() {
        let collector = AcquisitionCollector::new();
        // First sample anchors the window; rate needs elapsed time.
        assert_eq!(collector.points_per_second(), 0.0);
        collector.record_points(500);
        std::thread::sleep(Duration::from_millis(50));
        let rate = collector.points_per_second();
        assert!(rate > 0.0, "expected positive rate, got {rate}");
    }

    #[test]
    fn breaker_state_is_carried_into_the_snapshot() {
        let collector = AcquisitionCollector::new();
        collector.record_breaker_state(1, "tgbt-a", "Open");
        let snapshot = collector.snapshot(queue());
        assert_eq!(snapshot.devices[0].breaker_state, "Open");
    }

    #[test]
    fn snapshot_serializes_for_the_health_surface() {
        let collector = AcquisitionCollector::new();
        collector.record_success(1, "tgbt-a", Duration::from_millis(12));
        let json = serde_json::to_value(collector.snapshot(queue())).unwrap();
        assert_eq!(json["queue"]["max_buffer_size"], 1000);
        assert_eq!(json["devices"][0]["device_id"], 1);
    }
}
