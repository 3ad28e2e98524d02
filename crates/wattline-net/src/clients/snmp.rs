//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Device protocol clients and the uniform read contract."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use csnmp::{ObjectIdentifier, ObjectValue, Snmp2cClient};
use tracing::{debug, warn};
use wattline_common::config::ProtocolConfig;
use wattline_schema::{Device, ProtocolKind};

use crate::clients::ProtocolClient;
use crate::ProtocolError;

/// sysDescr.0, readable on any conformant agent; used for reachability.
const SYS_DESCR_OID: &str = "1.3.6.1.2.1.1.1.0";

/// SNMPv2c client for meters reached through a protocol gateway.
///
/// The community string and agent port come from the device row's metadata
/// (`community`, `port`). The uniform contract exposes nullable numeric
/// values; [`SnmpProtocolClient::read_typed`] keeps the protocol-typed
/// values for callers that need them.
pub struct SnmpProtocolClient {
    timeout: Duration,
}

/// Generic value decoded from an SNMP variable binding.
#[derive(Debug, Clone, PartialEq)]
pub enum SnmpValue {
    /// Signed integer (Integer32).
    Integer(i64),
    /// Unsigned integer (Gauge32/Unsigned32, Counter32, Counter64).
    Unsigned(u64),
    /// Hundredths of a second since agent start.
    TimeTicks(u32),
    /// Octet string, decoded lossily as UTF-8.
    Text(String),
    /// Explicit null binding.
    Null,
}

impl SnmpValue {
    /// Numeric view used by the uniform read contract. Text parses as a
    /// number when the gateway publishes numerics as strings; anything else
    /// is absent.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SnmpValue::Integer(value) => Some(*value as f64),
            SnmpValue::Unsigned(value) => Some(*value as f64),
            SnmpValue::TimeTicks(value) => Some(f64::from(*value)),
            SnmpValue::Text(text) => text.trim().parse::<f64>().ok(),
            SnmpValue::Null => None,
        }
    }

    /// Whether the binding carried any value at all.
    pub fn is_present(&self) -> bool {
        !matches!(self, SnmpValue::Null)
    }
}

impl From<ObjectValue> for SnmpValue {
    fn from(value: ObjectValue) -> Self {
        match value {
            ObjectValue::Integer(v) => SnmpValue::Integer(i64::from(v)),
            ObjectValue::Counter32(v) => SnmpValue::Unsigned(u64::from(v)),
            ObjectValue::Unsigned32(v) => SnmpValue::Unsigned(u64::from(v)),
            ObjectValue::Counter64(v) => SnmpValue::Unsigned(v),
            ObjectValue::TimeTicks(v) => SnmpValue::TimeTicks(v),
            ObjectValue::String(bytes) => {
                SnmpValue::Text(String::from_utf8_lossy(&bytes).into_owned())
            }
            other => SnmpValue::Text(format!("{other:?}")),
        }
    }
}

impl SnmpProtocolClient {
    /// Build a client with the configured per-request timeout.
    pub fn new(config: &ProtocolConfig) -> Self {
        Self {
            timeout: config.snmp_timeout(),
        }
    }

    fn target(&self, device: &Device) -> Result<SocketAddr, ProtocolError> {
        let ip: IpAddr = device
            .ip_address
            .parse()
            .map_err(|_| ProtocolError::InvalidTarget(device.ip_address.clone()))?;
        Ok(SocketAddr::new(ip, device.snmp_port()))
    }

    /// Read a batch of OIDs, keeping the protocol-typed values.
    ///
    /// A per-OID failure (bad OID syntax, missing binding) yields `None` for
    /// that OID. If every OID of a non-empty batch fails at the transport
    /// level the whole call fails, so a dead gateway is indistinguishable
    /// from a dead meter — which is exactly how the reader wants to count it.
    pub async fn read_typed(
        &self,
        device: &Device,
        addresses: &[String],
    ) -> Result<HashMap<String, Option<SnmpValue>>, ProtocolError> {
        if addresses.is_empty() {
            return Ok(HashMap::new());
        }
        let target = self.target(device)?;
        let community = device.snmp_community().into_bytes();
        let client = Snmp2cClient::new(target, community, None, Some(self.timeout))
            .await
            .map_err(|err| ProtocolError::Transport(err.to_string()))?;

        debug!(
            device_id = device.device_id,
            target = %target,
            count = addresses.len(),
            "reading snmp oids"
        );

        let mut values = HashMap::with_capacity(addresses.len());
        let mut fetched = 0usize;
        let mut transport_failures = 0usize;
        let mut first_error: Option<String> = None;
        for address in addresses {
            let oid: ObjectIdentifier = match address.parse() {
                Ok(oid) => oid,
                Err(_) => {
                    warn!(device_id = device.device_id, address = %address, "unparseable oid");
                    values.insert(address.clone(), None);
                    continue;
                }
            };
            match client.get(oid).await {
                Ok(binding) => {
                    fetched += 1;
                    let value = SnmpValue::from(binding);
                    debug!(device_id = device.device_id, oid = %address, value = ?value, "snmp oid read");
                    values.insert(address.clone(), Some(value));
                }
                Err(err) => {
                    transport_failures += 1;
                    if first_error.is_none() {
                        first_error = Some(err.to_string());
                    }
                    warn!(device_id = device.device_id, oid = %address, error = %err, "snmp get failed");
                    values.insert(address.clone(), None);
                }
            }
        }

        if fetched == 0 && transport_failures > 0 {
            return Err(ProtocolError::Transport(
                first_error.unwrap_or_else(|| "snmp get failed".to_owned()),
            ));
        }
        Ok(values)
    }
}

#[async_trait]
impl ProtocolClient for SnmpProtocolClient {
    async fn read(
        &self,
        device: &Device,
        addresses: &[String],
    ) -> Result<HashMap<String, Option<f64>>, ProtocolError> {
        let typed = self.read_typed(device, addresses).await?;
        Ok(typed
            .into_iter()
            .map(|(address, value)| (address, value.and_then(|v| v.as_f64())))
            .collect())
    }

    async fn test_connectivity(&self, device: &Device) -> bool {
        match self.read_typed(device, &[SYS_DESCR_OID.to_owned()]).await {
            Ok(values) => values
                .values()
                .any(|value| value.as_ref().is_some_and(|v| v.is_present())),
            Err(err) => {
                debug!(device_id = device.device_id, error = %err, "snmp connectivity test failed");
                false
            }
        }
    }

    fn request_timeout(&self) -> Duration {
        self.timeout
    }

    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Snmp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snmp_device(ip: &str, port: u16) -> Device {
        Device {
            device_id: 9,
            name: "m50-gateway".into(),
            ip_address: ip.into(),
            protocol: ProtocolKind::Snmp,
            enabled: true,
            poll_interval_ms: 5000,
            last_seen_utc: None,
            metadata: serde_json::json!({ "community": "public", "port": port }),
        }
    }

    fn quick_client() -> SnmpProtocolClient {
        SnmpProtocolClient::new(&ProtocolConfig {
            request_timeout_ms: 500,
            snmp_timeout_ms: 500,
            retry_attempts: 1,
            retry_backoff_base_ms: 10,
        })
    }

    #[test]
    fn numeric_conversions_cover_the_snmp_types() {
        assert_eq!(SnmpValue::Integer(-42).as_f64(), Some(-42.0));
        assert_eq!(SnmpValue::Unsigned(1234).as_f64(), Some(1234.0));
        assert_eq!(SnmpValue::TimeTicks(100).as_f64(), Some(100.0));
        assert_eq!(SnmpValue::Text("230.5".into()).as_f64(), Some(230.5));
        assert_eq!(SnmpValue::Text("Socomec M50".into()).as_f64(), None);
        assert_eq!(SnmpValue::Null.as_f64(), None);
    }

    #[test]
    fn presence_ignores_numeric_convertibility() {
        assert!(SnmpValue::Text("sysDescr text".into()).is_present());
        assert!(!SnmpValue::Null.is_present());
    }

    #[tokio::test]
    async fn connectivity_test_against_unreachable_host_is_false_not_an_error() {
        let client = quick_client();
        // Nothing listens here; the probe must come back false within the
        // configured timeout instead of propagating an error.
        let device = snmp_device("127.0.0.1", 59161);
        assert!(!client.test_connectivity(&device).await);
    }

    #[tokio::test]
    async fn invalid_target_address_fails_the_whole_read() {
        let client = quick_client();
        let device = snmp_device("not-an-ip", 161);
        let err = client
            .read(&device, &["1.3.6.1.2.1.1.1.0".to_owned()])
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidTarget(_)));
    }
}
