//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Per-device circuit breaking for the acquisition loop."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Per-device circuit breaking.
//!
//! Each device owns one [`CircuitBreaker`]; a persistently failing device
//! stops being contacted for a cool-down window instead of being hammered
//! on every poll cycle. Breakers live in a [`BreakerRegistry`] keyed by
//! device id — the registry lock only guards map shape, each breaker's
//! state sits behind its own mutex so unrelated devices never contend.

#![warn(missing_docs)]

/// Circuit breaker state machine and registry.
pub mod breaker;

pub use breaker::{BreakerRegistry, BreakerState, CircuitBreaker, ReadPermit};
