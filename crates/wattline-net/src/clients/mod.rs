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
use std::time::Duration;

use async_trait::async_trait;
use wattline_schema::{Device, ProtocolKind};

use crate::ProtocolError;

/// Uniform read contract implemented by protocol-specific clients.
///
/// `read` returns one entry per requested address. An address whose value
/// could not be obtained (device-side error code, missing binding,
/// non-numeric payload) maps to `None`; only whole-call failures surface as
/// an `Err`.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Read a batch of protocol addresses from one device.
    async fn read(
        &self,
        device: &Device,
        addresses: &[String],
    ) -> Result<HashMap<String, Option<f64>>, ProtocolError>;

    /// Cheap reachability probe; never returns an error.
    async fn test_connectivity(&self, device: &Device) -> bool;

    /// Configured hard per-request timeout.
    fn request_timeout(&self) -> Duration;

    /// Protocol this client speaks, used by the reader to route devices.
    fn kind(&self) -> ProtocolKind;
}

pub mod snmp;
pub mod webmi;
