//! ---
//! ems_section: "15-testing-qa-runbook"
//! ems_subsection: "integration-test"
//! ems_type: "source"
//! ems_scope: "test"
//! ems_description: "End-to-end acquisition pipeline tests over in-memory collaborators."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use wattline_common::config::{AcquisitionConfig, BreakerConfig, WriterConfig};
use wattline_core::{queue_snapshot, AcquisitionScheduler, DeviceReader};
use wattline_metrics::AcquisitionCollector;
use wattline_net::{ProtocolClient, ProtocolError};
use wattline_persistence::{BulkWriter, MemoryMeasurementStore};
use wattline_resilience::BreakerRegistry;
use wattline_schema::{
    Device, DeviceRegistry, InMemoryDeviceRegistry, ProtocolKind, Quality, TagMap,
};

/// Simulated meter fleet: answers every address with a fixed value, except
/// devices listed as dead, whose reads fail at transport level.
struct SimFleet {
    dead_devices: Vec<i32>,
    reads: AtomicUsize,
}

impl SimFleet {
    fn new(dead_devices: Vec<i32>) -> Self {
        Self {
            dead_devices,
            reads: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ProtocolClient for SimFleet {
    async fn read(
        &self,
        device: &Device,
        addresses: &[String],
    ) -> Result<HashMap<String, Option<f64>>, ProtocolError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.dead_devices.contains(&device.device_id) {
            return Err(ProtocolError::Transport("connection refused".into()));
        }
        Ok(addresses
            .iter()
            .map(|address| (address.clone(), Some(4200.0)))
            .collect())
    }

    async fn test_connectivity(&self, device: &Device) -> bool {
        !self.dead_devices.contains(&device.device_id)
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_millis(1500)
    }

    fn kind(&self) -> ProtocolKind {
        ProtocolKind::WebMi
    }
}

fn device(id: i32, poll_interval_ms: u64) -> Device {
    Device {
        device_id: id,
        name: format!("diris-{id}"),
        ip_address: format!("10.0.0.{id}"),
        protocol: ProtocolKind::WebMi,
        enabled: true,
        poll_interval_ms,
        last_seen_utc: None,
        metadata: serde_json::Value::Null,
    }
}

fn tags(device_id: i32) -> Vec<TagMap> {
    vec![
        TagMap {
            device_id,
            signal: "U_L1".into(),
            address: "U1_255".into(),
            unit: Some("V".into()),
            scale: 100.0,
            enabled: true,
            description: None,
        },
        TagMap {
            device_id,
            signal: "I_L1".into(),
            address: "I1_255".into(),
            unit: Some("A".into()),
            scale: 10.0,
            enabled: true,
            description: None,
        },
    ]
}

struct Pipeline {
    registry: Arc<InMemoryDeviceRegistry>,
    store: Arc<MemoryMeasurementStore>,
    writer: BulkWriter,
    collector: Arc<AcquisitionCollector>,
    reader: Arc<DeviceReader>,
}

fn build_pipeline(fleet: Arc<SimFleet>, breaker: BreakerConfig) -> Pipeline {
    let registry = Arc::new(InMemoryDeviceRegistry::new());
    let store = Arc::new(MemoryMeasurementStore::new());
    let writer = BulkWriter::spawn(
        store.clone(),
        WriterConfig {
            max_buffer_size: 1000,
            min_batch_size: 1,
            flush_interval_ms: 20,
            shutdown_flush_wait_ms: 1000,
        },
        None,
    );
    let reader = Arc::new(
        DeviceReader::new(registry.clone(), Arc::new(BreakerRegistry::new(breaker)))
            .with_client(fleet),
    );
    let collector = Arc::new(AcquisitionCollector::new());
    Pipeline {
        registry,
        store,
        writer,
        collector,
        reader,
    }
}

fn fast_schedule() -> AcquisitionConfig {
    AcquisitionConfig {
        default_poll_interval_ms: 20,
        refresh_interval_ms: 40,
        start_jitter_pct: 0.0,
    }
}

#[tokio::test]
async fn measurements_flow_from_devices_to_storage() {
    let fleet = Arc::new(SimFleet::new(Vec::new()));
    let pipeline = build_pipeline(fleet, BreakerConfig::default());
    for id in [1, 2] {
        pipeline.registry.upsert_device(device(id, 20));
        pipeline.registry.set_mappings(id, tags(id));
    }

    let scheduler = AcquisitionScheduler::new(
        pipeline.registry.clone(),
        pipeline.reader.clone(),
        pipeline.writer.clone(),
        pipeline.collector.clone(),
        None,
        fast_schedule(),
    );
    let handle = scheduler.start();
    sleep(Duration::from_millis(250)).await;
    handle.shutdown().await;
    pipeline.writer.flush().await.unwrap();

    let rows = pipeline.store.rows();
    assert!(!rows.is_empty(), "expected measurements in storage");
    // Scale rules applied end to end: 4200 raw / 100 and / 10.
    assert!(rows
        .iter()
        .any(|m| m.signal == "U_L1" && m.value == 42.0 && m.quality == Quality::Ok));
    assert!(rows
        .iter()
        .any(|m| m.signal == "I_L1" && m.value == 420.0 && m.quality == Quality::Ok));

    // Both devices were polled and their last-seen advanced.
    for id in [1, 2] {
        let row = pipeline.registry.device(id).await.unwrap().unwrap();
        assert!(row.last_seen_utc.is_some(), "device {id} last-seen not set");
    }

    let snapshot = pipeline
        .collector
        .snapshot(queue_snapshot(&pipeline.writer));
    assert_eq!(snapshot.devices.len(), 2);
    for device in &snapshot.devices {
        assert!(device.success_rate > 0.99, "device {} unhealthy", device.device_id);
        assert_eq!(device.breaker_state, "Closed");
    }
    assert!(snapshot.throughput.points_per_second > 0.0);
    assert_eq!(snapshot.queue.max_buffer_size, 1000);
}

#[tokio::test]
async fn a_dead_device_trips_its_breaker_without_disturbing_the_fleet() {
    let fleet = Arc::new(SimFleet::new(vec![2]));
    let pipeline = build_pipeline(
        fleet,
        BreakerConfig {
            failure_threshold: 2,
            cool_down_ms: 60_000,
        },
    );
    for id in [1, 2] {
        pipeline.registry.upsert_device(device(id, 20));
        pipeline.registry.set_mappings(id, tags(id));
    }

    let scheduler = AcquisitionScheduler::new(
        pipeline.registry.clone(),
        pipeline.reader.clone(),
        pipeline.writer.clone(),
        pipeline.collector.clone(),
        None,
        fast_schedule(),
    );
    let handle = scheduler.start();
    sleep(Duration::from_millis(300)).await;
    handle.shutdown().await;
    pipeline.writer.flush().await.unwrap();

    let snapshot = pipeline
        .collector
        .snapshot(queue_snapshot(&pipeline.writer));
    let healthy = snapshot.devices.iter().find(|d| d.device_id == 1).unwrap();
    let dead = snapshot.devices.iter().find(|d| d.device_id == 2).unwrap();

    assert!(healthy.success_rate > 0.99);
    assert_eq!(healthy.breaker_state, "Closed");
    assert_eq!(dead.breaker_state, "Open");
    assert!(dead.error_count >= 2);
    assert_eq!(dead.success_rate, 0.0);

    // Nothing from the dead device reached storage; the healthy one did.
    let rows = pipeline.store.rows();
    assert!(rows.iter().all(|m| m.device_id == 1));
    assert!(!rows.is_empty());

    // Once open, cycles are suppressed: the dead device stops being read.
    let reads_after_trip = pipeline.reader.breakers().handle(2).error_count();
    assert_eq!(reads_after_trip, 2, "skipped cycles must not grow the counter");
}

#[tokio::test]
async fn disabling_a_device_stops_its_poll_task() {
    let fleet = Arc::new(SimFleet::new(Vec::new()));
    let pipeline = build_pipeline(fleet.clone(), BreakerConfig::default());
    pipeline.registry.upsert_device(device(1, 20));
    pipeline.registry.set_mappings(1, tags(1));

    let scheduler = AcquisitionScheduler::new(
        pipeline.registry.clone(),
        pipeline.reader.clone(),
        pipeline.writer.clone(),
        pipeline.collector.clone(),
        None,
        fast_schedule(),
    );
    let handle = scheduler.start();
    sleep(Duration::from_millis(100)).await;

    let mut row = pipeline.registry.device(1).await.unwrap().unwrap();
    row.enabled = false;
    pipeline.registry.upsert_device(row);
    sleep(Duration::from_millis(100)).await;

    let reads_at_disable = fleet.reads.load(Ordering::SeqCst);
    sleep(Duration::from_millis(150)).await;
    let reads_later = fleet.reads.load(Ordering::SeqCst);
    // One in-flight cycle may still complete around the disable.
    assert!(
        reads_later <= reads_at_disable + 1,
        "poll task kept reading a disabled device"
    );

    handle.shutdown().await;
}
