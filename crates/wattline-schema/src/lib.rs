//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared schema definitions for the acquisition pipeline."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Schema definitions for the Wattline acquisition pipeline.
//!
//! This crate hosts the strongly typed data model shared by the protocol
//! clients, the device reader, the bulk writer, and the metrics surface:
//! devices, tag mappings, quality-tagged measurements, and per-cycle
//! readings, together with the [`DeviceRegistry`] boundary trait.

#![warn(missing_docs)]

/// Shared result type for schema validation routines.
pub type SchemaResult<T> = Result<T, SchemaError>;

/// Error type for schema validation issues.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    /// Raised when a tag mapping carries a scale factor that cannot divide.
    #[error("tag {device_id}/{signal}: scale must be nonzero and finite, got {scale}")]
    InvalidScale {
        /// Device owning the offending mapping.
        device_id: i32,
        /// Signal name of the offending mapping.
        signal: String,
        /// The rejected scale value.
        scale: f64,
    },
    /// Raised when a device row is missing a usable network address.
    #[error("device {0}: empty ip address")]
    MissingAddress(i32),
}

/// Device, tag-mapping, and measurement types.
pub mod model;
/// Registry boundary trait and in-memory implementation.
pub mod registry;

pub use model::{
    Device, DeviceReading, Measurement, ProtocolKind, Quality, TagMap,
};
pub use registry::{DeviceRegistry, InMemoryDeviceRegistry, RegistryError};
