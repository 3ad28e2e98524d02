//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the acquisition runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Shared runtime primitives for Wattline services: configuration loading
//! and validation, tracing bootstrap, and small time helpers.

pub mod config;
pub mod logging;
pub mod time;
