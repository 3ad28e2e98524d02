//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Buffered bulk ingestion and measurement storage."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::debug;
use wattline_common::config::StorageConfig;
use wattline_schema::Measurement;

use crate::{PersistenceError, Result};

/// Rows per INSERT statement, kept well under the driver's bind limit
/// (6 binds per row, 65535 binds per statement).
const INSERT_CHUNK_ROWS: usize = 5000;

/// Durable sink for measurement batches.
///
/// A batch is written as a single all-or-nothing transaction; the writer
/// relies on that to requeue the whole batch on failure.
#[async_trait]
pub trait MeasurementStore: Send + Sync {
    /// Insert every measurement of the batch, preserving slice order.
    /// Returns the number of rows written.
    async fn insert_batch(&self, batch: &[Measurement]) -> Result<u64>;
}

/// PostgreSQL measurement store.
///
/// Writes into the `measurements` table with an explicit column list
/// (`device_id, utc_ts, signal, value, quality, ingest_ts`); quality is
/// stored as `SMALLINT` carrying the 1/2/3 wire values.
pub struct PgMeasurementStore {
    pool: PgPool,
    command_timeout: Duration,
}

impl PgMeasurementStore {
    /// Connect a pool against the configured database URL.
    pub async fn connect(config: &StorageConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&config.database_url)
            .await?;
        Ok(Self::with_pool(pool, config.command_timeout()))
    }

    /// Wrap an existing pool.
    pub fn with_pool(pool: PgPool, command_timeout: Duration) -> Self {
        Self {
            pool,
            command_timeout,
        }
    }

    async fn write_transaction(&self, batch: &[Measurement]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;
        for chunk in batch.chunks(INSERT_CHUNK_ROWS) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO measurements (device_id, utc_ts, signal, value, quality, ingest_ts) ",
            );
            builder.push_values(chunk, |mut row, measurement| {
                row.push_bind(measurement.device_id)
                    .push_bind(measurement.utc_ts)
                    .push_bind(measurement.signal.as_str())
                    .push_bind(measurement.value)
                    .push_bind(i16::from(measurement.quality.as_u8()))
                    .push_bind(measurement.ingest_ts);
            });
            let result = builder.build().execute(&mut *tx).await?;
            written += result.rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }
}

#[async_trait]
impl MeasurementStore for PgMeasurementStore {
    async fn insert_batch(&self, batch: &[Measurement]) -> Result<u64> {
        if batch.is_empty() {
            return Ok(0);
        }
        let written = tokio::time::timeout(self.command_timeout, self.write_transaction(batch))
            .await
            .map_err(|_| PersistenceError::Timeout(self.command_timeout))??;
        debug!(rows = written, "bulk insert committed");
        Ok(written)
    }
}

/// In-memory measurement store for tests and simulation runs.
///
/// The failure toggle makes the next inserts fail atomically, which is how
/// the writer's requeue path is exercised.
#[derive(Debug, Default)]
pub struct MemoryMeasurementStore {
    rows: Mutex<Vec<Measurement>>,
    failing: AtomicBool,
}

impl MemoryMeasurementStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent inserts fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of rows written so far.
    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    /// Whether anything was written.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of all rows, in insertion order.
    pub fn rows(&self) -> Vec<Measurement> {
        self.rows.lock().clone()
    }
}

#[async_trait]
impl MeasurementStore for MemoryMeasurementStore {
    async fn insert_batch(&self, batch: &[Measurement]) -> Result<u64> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PersistenceError::Storage(
                "induced storage failure".to_owned(),
            ));
        }
        let mut rows = self.rows.lock();
        rows.extend_from_slice(batch);
        Ok(batch.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use wattline_schema::Quality;

    fn sample(signal: &str) -> Measurement {
        Measurement {
            device_id: 1,
            utc_ts: Utc::now(),
            signal: signal.to_owned(),
            value: 1.0,
            quality: Quality::Ok,
            ingest_ts: Utc::now(),
        }
    }

    #[tokio::test]
    async fn memory_store_keeps_insertion_order() {
        let store = MemoryMeasurementStore::new();
        store
            .insert_batch(&[sample("a"), sample("b")])
            .await
            .unwrap();
        store.insert_batch(&[sample("c")]).await.unwrap();

        let signals: Vec<String> = store.rows().into_iter().map(|m| m.signal).collect();
        assert_eq!(signals, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn memory_store_failure_toggle_is_all_or_nothing() {
        let store = MemoryMeasurementStore::new();
        store.set_failing(true);
        assert!(store.insert_batch(&[sample("a")]).await.is_err());
        assert!(store.is_empty());

        store.set_failing(false);
        assert_eq!(store.insert_batch(&[sample("a")]).await.unwrap(), 1);
        assert_eq!(store.len(), 1);
    }
}
