//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Device reading and acquisition scheduling."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Acquisition core: the per-device reader and the scheduler that drives
//! one independent polling cadence per enabled device.

pub mod reader;
pub mod scheduler;

pub use reader::DeviceReader;
pub use scheduler::{queue_snapshot, AcquisitionScheduler, SchedulerHandle};
