//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared schema definitions for the acquisition pipeline."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{SchemaError, SchemaResult};

/// Default SNMP agent port used when the device metadata does not override it.
pub const DEFAULT_SNMP_PORT: u16 = 161;

/// Default SNMP community string used when the device metadata does not override it.
pub const DEFAULT_SNMP_COMMUNITY: &str = "public";

/// Wire protocol spoken by a metering device.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProtocolKind {
    /// WebMI HTTP/JSON polling endpoint exposed by the meter itself.
    #[default]
    WebMi,
    /// SNMPv2c agent, typically a protocol gateway in front of the meter.
    Snmp,
}

/// A metering device as provided by the registry collaborator.
///
/// The acquisition core treats device rows as read-only; it re-reads the row
/// once per poll cycle and only writes back through
/// [`DeviceRegistry::update_last_seen`](crate::DeviceRegistry::update_last_seen).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Registry identity of the device.
    pub device_id: i32,
    /// Human-readable device name.
    pub name: String,
    /// Network address of the device or its protocol gateway.
    pub ip_address: String,
    /// Wire protocol used to read the device.
    #[serde(default)]
    pub protocol: ProtocolKind,
    /// Whether the scheduler should poll this device.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Poll cadence for this device, milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Timestamp of the last successful poll, maintained by the registry.
    #[serde(default)]
    pub last_seen_utc: Option<DateTime<Utc>>,
    /// Free-form metadata; the SNMP client reads `community` and `port` here.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

fn default_true() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    1500
}

impl Device {
    /// WebMI batched-read endpoint for this device.
    pub fn webmi_endpoint(&self) -> String {
        format!("http://{}/webMI/?read", self.ip_address)
    }

    /// SNMP community string, from metadata or the conventional default.
    pub fn snmp_community(&self) -> String {
        self.metadata
            .get("community")
            .and_then(|value| value.as_str())
            .unwrap_or(DEFAULT_SNMP_COMMUNITY)
            .to_owned()
    }

    /// SNMP agent port, from metadata or the registered default.
    pub fn snmp_port(&self) -> u16 {
        self.metadata
            .get("port")
            .and_then(|value| value.as_u64())
            .and_then(|port| u16::try_from(port).ok())
            .unwrap_or(DEFAULT_SNMP_PORT)
    }

    /// Poll cadence as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Display label used in logs and metric snapshots.
    pub fn display_name(&self) -> String {
        format!("{} ({})", self.name, self.ip_address)
    }

    /// Validate the parts of a device row the acquisition core depends on.
    pub fn validate(&self) -> SchemaResult<()> {
        if self.ip_address.trim().is_empty() {
            return Err(SchemaError::MissingAddress(self.device_id));
        }
        Ok(())
    }
}

/// Mapping between a protocol-specific address and a named physical signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagMap {
    /// Device this mapping belongs to.
    pub device_id: i32,
    /// Physical signal name, e.g. `U_L1` or `P_total`.
    pub signal: String,
    /// Protocol address: a WebMI key or an SNMP OID.
    pub address: String,
    /// Engineering unit of the scaled value.
    #[serde(default)]
    pub unit: Option<String>,
    /// Divisor applied to raw values; never zero.
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// Whether this signal participates in acquisition.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Optional operator note.
    #[serde(default)]
    pub description: Option<String>,
}

fn default_scale() -> f64 {
    1.0
}

impl TagMap {
    /// Convert a raw protocol value into the physical quantity.
    ///
    /// The domain defines the conversion as a division by the scale factor,
    /// not a multiplication.
    pub fn apply_scale(&self, raw: f64) -> f64 {
        raw / self.scale
    }

    /// Reject mappings whose scale cannot be used as a divisor.
    pub fn validate(&self) -> SchemaResult<()> {
        if self.scale == 0.0 || !self.scale.is_finite() {
            return Err(SchemaError::InvalidScale {
                device_id: self.device_id,
                signal: self.signal.clone(),
                scale: self.scale,
            });
        }
        Ok(())
    }
}

/// Read-confidence indicator attached to every measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    /// Value was read and scaled normally.
    Ok = 1,
    /// Reserved for partial-validity conditions; the read path never emits it.
    Warning = 2,
    /// Value was absent or the read failed; the stored value is 0.0.
    Error = 3,
}

impl Quality {
    /// Wire/storage representation.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Human-readable label used in snapshots and logs.
    pub fn description(self) -> &'static str {
        match self {
            Quality::Ok => "OK",
            Quality::Warning => "Warning",
            Quality::Error => "Error",
        }
    }
}

/// One quality-tagged sample of one signal of one device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Measurement {
    /// Device the sample belongs to.
    pub device_id: i32,
    /// Timestamp of the poll cycle that produced the sample.
    pub utc_ts: DateTime<Utc>,
    /// Signal name from the tag mapping.
    pub signal: String,
    /// Scaled physical value; 0.0 when quality is [`Quality::Error`].
    pub value: f64,
    /// Read confidence; always set.
    pub quality: Quality,
    /// Timestamp at which the sample entered the ingest pipeline.
    pub ingest_ts: DateTime<Utc>,
}

/// Outcome of one poll cycle for one device.
///
/// Produced by the device reader and consumed immediately by the scheduler;
/// never persisted as an entity.
#[derive(Debug, Clone)]
pub struct DeviceReading {
    /// Device the cycle ran against.
    pub device_id: i32,
    /// Device name at the time of the cycle.
    pub device_name: String,
    /// Cycle start timestamp; also the `utc_ts` of every measurement.
    pub utc_ts: DateTime<Utc>,
    /// Measurements in tag-mapping order.
    pub measurements: Vec<Measurement>,
    /// Wall-clock duration of the cycle.
    pub poll_duration: Duration,
    /// Whether the protocol call as a whole succeeded.
    pub success: bool,
    /// Set when the circuit breaker suppressed the cycle without contacting
    /// the device; such readings carry no measurements and are not counted
    /// as attempts.
    pub skipped: bool,
    /// Error text when `success` is false.
    pub error_message: Option<String>,
}

impl DeviceReading {
    /// Empty reading skeleton for the given device and cycle start.
    pub fn started(device: &Device, utc_ts: DateTime<Utc>) -> Self {
        Self {
            device_id: device.device_id,
            device_name: device.name.clone(),
            utc_ts,
            measurements: Vec::new(),
            poll_duration: Duration::ZERO,
            success: false,
            skipped: false,
            error_message: None,
        }
    }

    /// Number of measurements read with [`Quality::Ok`].
    pub fn success_count(&self) -> usize {
        self.measurements
            .iter()
            .filter(|m| m.quality == Quality::Ok)
            .count()
    }

    /// Number of measurements recorded with [`Quality::Error`].
    pub fn error_count(&self) -> usize {
        self.measurements
            .iter()
            .filter(|m| m.quality == Quality::Error)
            .count()
    }
}
