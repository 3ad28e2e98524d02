//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared schema definitions for the acquisition pipeline."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::model::{Device, TagMap};

/// Error type for registry lookups.
///
/// The registry itself is an external collaborator; the acquisition core only
/// needs a way to tell "the registry misbehaved" apart from "device gone".
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The backing store rejected or failed the operation.
    #[error("registry backend error: {0}")]
    Backend(String),
}

/// Read-mostly boundary to the device/tag-mapping registry.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// All devices currently enabled for acquisition.
    async fn enabled_devices(&self) -> Result<Vec<Device>, RegistryError>;

    /// A single device row, or `None` if it no longer exists.
    async fn device(&self, device_id: i32) -> Result<Option<Device>, RegistryError>;

    /// All tag mappings configured for a device, enabled or not.
    async fn tag_mappings(&self, device_id: i32) -> Result<Vec<TagMap>, RegistryError>;

    /// Record a successful contact with the device.
    async fn update_last_seen(
        &self,
        device_id: i32,
        at: DateTime<Utc>,
    ) -> Result<(), RegistryError>;
}

#[derive(Debug, Default)]
struct RegistryInner {
    devices: HashMap<i32, Device>,
    mappings: HashMap<i32, Vec<TagMap>>,
}

/// In-memory registry backing tests, simulation, and config-file deployments.
#[derive(Debug, Default)]
pub struct InMemoryDeviceRegistry {
    inner: RwLock<RegistryInner>,
}

impl InMemoryDeviceRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a device row.
    pub fn upsert_device(&self, device: Device) {
        self.inner.write().devices.insert(device.device_id, device);
    }

    /// Replace the tag mappings of a device.
    pub fn set_mappings(&self, device_id: i32, mappings: Vec<TagMap>) {
        self.inner.write().mappings.insert(device_id, mappings);
    }

    /// Remove a device and its mappings.
    pub fn remove_device(&self, device_id: i32) {
        let mut inner = self.inner.write();
        inner.devices.remove(&device_id);
        inner.mappings.remove(&device_id);
    }
}

#[async_trait]
impl DeviceRegistry for InMemoryDeviceRegistry {
    async fn enabled_devices(&self) -> Result<Vec<Device>, RegistryError> {
        let inner = self.inner.read();
        let mut devices: Vec<Device> = inner
            .devices
            .values()
            .filter(|device| device.enabled)
            .cloned()
            .collect();
        devices.sort_by_key(|device| device.device_id);
        Ok(devices)
    }

    async fn device(&self, device_id: i32) -> Result<Option<Device>, RegistryError> {
        Ok(self.inner.read().devices.get(&device_id).cloned())
    }

    async fn tag_mappings(&self, device_id: i32) -> Result<Vec<TagMap>, RegistryError> {
        Ok(self
            .inner
            .read()
            .mappings
            .get(&device_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn update_last_seen(
        &self,
        device_id: i32,
        at: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        if let Some(device) = self.inner.write().devices.get_mut(&device_id) {
            device.last_seen_utc = Some(at);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProtocolKind;

    fn device(id: i32, enabled: bool) -> Device {
        Device {
            device_id: id,
            name: format!("diris-{id}"),
            ip_address: format!("10.0.0.{id}"),
            protocol: ProtocolKind::WebMi,
            enabled,
            poll_interval_ms: 1000,
            last_seen_utc: None,
            metadata: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn enabled_devices_filters_and_orders() {
        let registry = InMemoryDeviceRegistry::new();
        registry.upsert_device(device(3, true));
        registry.upsert_device(device(1, true));
        registry.upsert_device(device(2, false));

        let enabled = registry.enabled_devices().await.unwrap();
        let ids: Vec<i32> = enabled.iter().map(|d| d.device_id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[tokio::test]
    async fn last_seen_round_trips() {
        let registry = InMemoryDeviceRegistry::new();
        registry.upsert_device(device(5, true));

        let at = Utc::now();
        registry.update_last_seen(5, at).await.unwrap();
        let row = registry.device(5).await.unwrap().unwrap();
        assert_eq!(row.last_seen_utc, Some(at));
    }
}
