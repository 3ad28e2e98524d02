//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Device protocol clients and the uniform read contract."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Wire-protocol clients for Wattline metering devices.
//!
//! Both the WebMI HTTP/JSON client and the SNMP client satisfy the same
//! [`ProtocolClient`] contract — read a batch of named addresses from one
//! device and return a nullable numeric value per address — so the device
//! reader stays protocol-agnostic.

use std::time::Duration;

pub mod clients;

pub use clients::snmp::{SnmpProtocolClient, SnmpValue};
pub use clients::webmi::WebMiClient;
pub use clients::ProtocolClient;

/// Error type for protocol client operations.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The request did not complete within the configured timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// Connection-level failure (refused, reset, unreachable, DNS).
    #[error("transport error: {0}")]
    Transport(String),
    /// The device answered with a non-success HTTP status.
    #[error("device returned http status {0}")]
    Status(u16),
    /// The device answered, but the payload could not be interpreted.
    #[error("malformed response: {0}")]
    Malformed(String),
    /// The device row carries an address the client cannot use.
    #[error("invalid target address: {0}")]
    InvalidTarget(String),
    /// No client is registered for the device's protocol.
    #[error("no protocol client registered for {0}")]
    UnsupportedProtocol(String),
}

impl ProtocolError {
    fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            ProtocolError::Timeout(timeout)
        } else {
            ProtocolError::Transport(err.to_string())
        }
    }
}
