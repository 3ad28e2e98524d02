//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Buffered bulk ingestion and measurement storage."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![warn(missing_docs)]

//! Measurement persistence: the [`MeasurementStore`] boundary, a PostgreSQL
//! bulk store, and the buffered [`BulkWriter`] that decouples acquisition
//! cadence from storage cadence.

use std::time::Duration;

/// Result alias used throughout the persistence crate.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Error type for the persistence subsystem.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Generic storage backend failure.
    #[error("storage error: {0}")]
    Storage(String),
    /// Wrapper for SQL driver errors.
    #[error("sql error: {0}")]
    Sql(#[from] sqlx::Error),
    /// The bulk-insert transaction exceeded the configured command timeout.
    #[error("bulk insert timed out after {0:?}")]
    Timeout(Duration),
    /// Wrapper for Prometheus metrics registration failures.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
    /// The writer control loop is no longer running.
    #[error("bulk writer is stopped")]
    WriterStopped,
}

/// Prometheus metrics for the ingest path.
pub mod metrics;
/// Measurement store trait and implementations.
pub mod store;
/// Buffered bulk writer control loop.
pub mod writer;

pub use metrics::IngestMetrics;
pub use store::{MeasurementStore, MemoryMeasurementStore, PgMeasurementStore};
pub use writer::{BulkWriter, QueueStats};
