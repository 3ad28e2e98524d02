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
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, warn};
use wattline_net::{ProtocolClient, ProtocolError};
use wattline_resilience::{BreakerRegistry, ReadPermit};
use wattline_schema::{
    Device, DeviceReading, DeviceRegistry, Measurement, ProtocolKind, Quality, RegistryError,
    TagMap,
};

/// Failure modes of one read cycle, folded into the reading's error text.
#[derive(Debug, thiserror::Error)]
enum ReadError {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Produces one [`DeviceReading`] per poll cycle for one device.
///
/// The reader is protocol-agnostic: it routes each device to the client
/// registered for the device's protocol and applies the same
/// scale-and-quality rules to whatever comes back. It also owns the
/// per-device circuit breaker bookkeeping — a cycle that fails outright
/// counts against the device, a cycle suppressed by an open breaker does
/// not contact the device at all.
pub struct DeviceReader {
    registry: Arc<dyn DeviceRegistry>,
    clients: HashMap<ProtocolKind, Arc<dyn ProtocolClient>>,
    breakers: Arc<BreakerRegistry>,
}

impl DeviceReader {
    /// Reader with no protocol clients registered yet.
    pub fn new(registry: Arc<dyn DeviceRegistry>, breakers: Arc<BreakerRegistry>) -> Self {
        Self {
            registry,
            clients: HashMap::new(),
            breakers,
        }
    }

    /// Register a protocol client under the protocol it reports.
    pub fn with_client(mut self, client: Arc<dyn ProtocolClient>) -> Self {
        self.clients.insert(client.kind(), client);
        self
    }

    /// Breaker registry, for health surfaces and manual resets.
    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    fn client_for(&self, kind: ProtocolKind) -> Result<&Arc<dyn ProtocolClient>, ProtocolError> {
        self.clients
            .get(&kind)
            .ok_or_else(|| ProtocolError::UnsupportedProtocol(kind.to_string()))
    }

    /// Run one poll cycle against a device. Never panics and never returns
    /// an error — every failure mode is folded into the reading.
    pub async fn read(&self, device: &Device) -> DeviceReading {
        let cycle_ts = Utc::now();
        let started = Instant::now();
        let mut reading = DeviceReading::started(device, cycle_ts);

        let breaker = self.breakers.handle(device.device_id);
        if let ReadPermit::Skipped { retry_in } = breaker.try_acquire(Instant::now()) {
            debug!(
                device_id = device.device_id,
                retry_in_ms = retry_in.as_millis() as u64,
                "circuit breaker open; skipping read"
            );
            reading.skipped = true;
            reading.error_message = Some("circuit breaker open; read skipped".to_owned());
            reading.poll_duration = started.elapsed();
            return reading;
        }

        match self.read_cycle(device, &mut reading).await {
            Ok(()) => {
                reading.success = true;
                breaker.record_success();
            }
            Err(err) => {
                warn!(device_id = device.device_id, error = %err, "device read failed");
                reading.measurements.clear();
                reading.success = false;
                reading.error_message = Some(err.to_string());
                breaker.record_failure(Instant::now());
            }
        }
        reading.poll_duration = started.elapsed();
        reading
    }

    async fn read_cycle(
        &self,
        device: &Device,
        reading: &mut DeviceReading,
    ) -> Result<(), ReadError> {
        let mappings = self.registry.tag_mappings(device.device_id).await?;
        let enabled: Vec<TagMap> = mappings.into_iter().filter(|tag| tag.enabled).collect();
        if enabled.is_empty() {
            warn!(
                device_id = device.device_id,
                "no enabled tag mappings; producing an empty reading"
            );
            return Ok(());
        }

        let client = self.client_for(device.protocol)?;
        let addresses: Vec<String> = enabled.iter().map(|tag| tag.address.clone()).collect();
        let values = client.read(device, &addresses).await?;

        for tag in &enabled {
            let raw = values.get(&tag.address).copied().flatten();
            let (value, quality) = match raw {
                Some(raw) => (tag.apply_scale(raw), Quality::Ok),
                None => (0.0, Quality::Error),
            };
            reading.measurements.push(Measurement {
                device_id: device.device_id,
                utc_ts: reading.utc_ts,
                signal: tag.signal.clone(),
                value,
                quality,
                ingest_ts: Utc::now(),
            });
        }

        debug!(
            device_id = device.device_id,
            ok = reading.success_count(),
            errors = reading.error_count(),
            "device read complete"
        );
        Ok(())
    }

    /// Independent connectivity probe for health checks; does not touch the
    /// error counter or the breaker.
    pub async fn probe(&self, device: &Device) -> bool {
        match self.client_for(device.protocol) {
            Ok(client) => client.test_connectivity(device).await,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use wattline_common::config::BreakerConfig;
    use wattline_resilience::BreakerState;
    use wattline_schema::InMemoryDeviceRegistry;

    type ReadResult = Result<HashMap<String, Option<f64>>, ProtocolError>;

    /// Protocol client whose responses are scripted per call; once the
    /// script is exhausted every further call repeats the last entry.
    struct ScriptedClient {
        script: Mutex<VecDeque<ReadResult>>,
        fallback: ReadResult,
        calls: AtomicUsize,
        probes: AtomicUsize,
    }

    impl ScriptedClient {
        fn new(fallback: ReadResult) -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
                fallback,
                calls: AtomicUsize::new(0),
                probes: AtomicUsize::new(0),
            }
        }

        fn push(&self, result: ReadResult) {
            self.script.lock().push_back(result);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn clone_result(result: &ReadResult) -> ReadResult {
        match result {
            Ok(map) => Ok(map.clone()),
            Err(err) => Err(ProtocolError::Transport(err.to_string())),
        }
    }

    #[async_trait]
    impl ProtocolClient for ScriptedClient {
        async fn read(&self, _device: &Device, _addresses: &[String]) -> ReadResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.script.lock().pop_front() {
                Some(result) => result,
                None => clone_result(&self.fallback),
            }
        }

        async fn test_connectivity(&self, _device: &Device) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn request_timeout(&self) -> Duration {
            Duration::from_millis(1500)
        }

        fn kind(&self) -> ProtocolKind {
            ProtocolKind::WebMi
        }
    }

    fn device() -> Device {
        Device {
            device_id: 1,
            name: "tgbt-a".into(),
            ip_address: "10.0.4.21".into(),
            protocol: ProtocolKind::WebMi,
            enabled: true,
            poll_interval_ms: 1000,
            last_seen_utc: None,
            metadata: serde_json::Value::Null,
        }
    }

    fn tag(signal: &str, address: &str, scale: f64) -> TagMap {
        TagMap {
            device_id: 1,
            signal: signal.into(),
            address: address.into(),
            unit: None,
            scale,
            enabled: true,
            description: None,
        }
    }

    fn breaker_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            cool_down_ms: 50,
        }
    }

    fn reader_with(
        registry: Arc<InMemoryDeviceRegistry>,
        client: Arc<ScriptedClient>,
    ) -> DeviceReader {
        DeviceReader::new(
            registry,
            Arc::new(BreakerRegistry::new(breaker_config())),
        )
        .with_client(client)
    }

    #[tokio::test]
    async fn present_values_are_scaled_and_absent_values_are_error_quality() {
        let registry = Arc::new(InMemoryDeviceRegistry::new());
        registry.upsert_device(device());
        registry.set_mappings(
            1,
            vec![tag("signal1", "key1", 1.0), tag("signal2", "key2", 10.0)],
        );

        let client = Arc::new(ScriptedClient::new(Ok(HashMap::new())));
        client.push(Ok(HashMap::from([
            ("key1".to_owned(), Some(100.0)),
            ("key2".to_owned(), None),
        ])));

        let reader = reader_with(registry, client);
        let reading = reader.read(&device()).await;

        assert!(reading.success);
        assert!(!reading.skipped);
        assert_eq!(reading.measurements.len(), 2);
        assert_eq!(reading.measurements[0].signal, "signal1");
        assert_eq!(reading.measurements[0].value, 100.0);
        assert_eq!(reading.measurements[0].quality, Quality::Ok);
        assert_eq!(reading.measurements[1].signal, "signal2");
        assert_eq!(reading.measurements[1].value, 0.0);
        assert_eq!(reading.measurements[1].quality, Quality::Error);
        assert_eq!(reading.success_count(), 1);
        assert_eq!(reading.error_count(), 1);
    }

    #[tokio::test]
    async fn transport_failure_yields_failed_reading_and_counts_against_the_device() {
        let registry = Arc::new(InMemoryDeviceRegistry::new());
        registry.upsert_device(device());
        registry.set_mappings(1, vec![tag("signal1", "key1", 1.0)]);

        let client = Arc::new(ScriptedClient::new(Err(ProtocolError::Timeout(
            Duration::from_millis(1500),
        ))));
        let reader = reader_with(registry, client);

        let reading = reader.read(&device()).await;
        assert!(!reading.success);
        assert!(reading.error_message.as_deref().unwrap().contains("timed out"));
        assert!(reading.measurements.is_empty());
        assert_eq!(reader.breakers().handle(1).error_count(), 1);
    }

    #[tokio::test]
    async fn empty_mapping_set_degrades_to_an_empty_successful_reading() {
        let registry = Arc::new(InMemoryDeviceRegistry::new());
        registry.upsert_device(device());
        registry.set_mappings(1, Vec::new());

        let client = Arc::new(ScriptedClient::new(Ok(HashMap::new())));
        let reader = reader_with(registry, client.clone());

        let reading = reader.read(&device()).await;
        assert!(reading.success);
        assert!(reading.measurements.is_empty());
        // The device is never contacted for an empty mapping set.
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn open_breaker_skips_reads_without_contacting_the_device() {
        let registry = Arc::new(InMemoryDeviceRegistry::new());
        registry.upsert_device(device());
        registry.set_mappings(1, vec![tag("signal1", "key1", 1.0)]);

        let client = Arc::new(ScriptedClient::new(Err(ProtocolError::Transport(
            "connection refused".into(),
        ))));
        let reader = reader_with(registry, client.clone());

        for _ in 0..3 {
            let reading = reader.read(&device()).await;
            assert!(!reading.success);
        }
        assert_eq!(reader.breakers().handle(1).state(), BreakerState::Open);
        assert_eq!(client.calls(), 3);

        let skipped = reader.read(&device()).await;
        assert!(skipped.skipped);
        assert!(!skipped.success);
        assert_eq!(client.calls(), 3);
        // The skip itself does not grow the failure counter.
        assert_eq!(reader.breakers().handle(1).error_count(), 3);
    }

    #[tokio::test]
    async fn half_open_probe_success_closes_the_breaker() {
        let registry = Arc::new(InMemoryDeviceRegistry::new());
        registry.upsert_device(device());
        registry.set_mappings(1, vec![tag("signal1", "key1", 1.0)]);

        let client = Arc::new(ScriptedClient::new(Ok(HashMap::from([(
            "key1".to_owned(),
            Some(50.0),
        )]))));
        for _ in 0..3 {
            client.push(Err(ProtocolError::Transport("connection refused".into())));
        }
        let reader = reader_with(registry, client.clone());

        for _ in 0..3 {
            reader.read(&device()).await;
        }
        assert_eq!(reader.breakers().handle(1).state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;
        let probe = reader.read(&device()).await;
        assert!(probe.success);
        assert_eq!(reader.breakers().handle(1).state(), BreakerState::Closed);
        assert_eq!(reader.breakers().handle(1).error_count(), 0);
    }

    #[tokio::test]
    async fn connectivity_probe_does_not_touch_the_error_counter() {
        let registry = Arc::new(InMemoryDeviceRegistry::new());
        registry.upsert_device(device());

        let client = Arc::new(ScriptedClient::new(Ok(HashMap::new())));
        let reader = reader_with(registry, client.clone());

        assert!(reader.probe(&device()).await);
        assert_eq!(client.probes.load(Ordering::SeqCst), 1);
        assert_eq!(reader.breakers().handle(1).error_count(), 0);
    }

    #[tokio::test]
    async fn unknown_protocol_fails_the_reading() {
        let registry = Arc::new(InMemoryDeviceRegistry::new());
        let mut snmp_device = device();
        snmp_device.protocol = ProtocolKind::Snmp;
        registry.upsert_device(snmp_device.clone());
        registry.set_mappings(1, vec![tag("signal1", "1.3.6.1.4.1.1", 1.0)]);

        let client = Arc::new(ScriptedClient::new(Ok(HashMap::new())));
        let reader = reader_with(registry, client);

        let reading = reader.read(&snmp_device).await;
        assert!(!reading.success);
        assert!(reading
            .error_message
            .as_deref()
            .unwrap()
            .contains("no protocol client"));
    }
}
