use crate::location::{DriverStatus, LocationUpdate};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Durable store for driver positions keyed by `(driver_id, recorded_at)`.
#[async_trait]
pub trait LocationStore: Send + Sync {
    async fn init_schema(&self) -> Result<(), StorageError>;

    /// Write all rows in one statement. Existing rows with the same key are
    /// overwritten, so re-running the same batch is a no-op.
    async fn upsert_locations(&self, rows: &[StoredLocation]) -> Result<usize, StorageError>;

    /// Most recent row for a driver.
    async fn get_latest(&self, driver_id: &str) -> Result<Option<StoredLocation>, StorageError>;

    async fn count_rows(&self) -> Result<u64, StorageError>;

    /// Delete rows whose expiry is at or before `now_ms`.
    async fn purge_expired(&self, now_ms: i64) -> Result<usize, StorageError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),
}

impl From<duckdb::Error> for StorageError {
    fn from(e: duckdb::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

/// One persisted position row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredLocation {
    pub driver_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: Option<f64>,
    pub bearing: Option<f64>,
    pub speed: Option<f64>,
    pub address: Option<String>,
    pub region_id: String,
    pub status: DriverStatus,
    pub is_available: bool,
    /// Epoch milliseconds
    pub recorded_at: i64,
    /// Epoch milliseconds; consumed by the retention sweep
    pub expires_at: i64,
}

impl StoredLocation {
    pub fn from_update(update: &LocationUpdate, horizon: Duration) -> Self {
        let horizon_ms = i64::try_from(horizon.as_millis()).unwrap_or(i64::MAX);
        Self {
            driver_id: update.driver_id.clone(),
            latitude: update.latitude,
            longitude: update.longitude,
            accuracy: update.accuracy,
            bearing: update.bearing,
            speed: update.speed,
            address: update.address.clone(),
            region_id: update.region_id.clone(),
            status: update.status.clone(),
            is_available: update.is_available,
            recorded_at: update.timestamp,
            expires_at: update.timestamp.saturating_add(horizon_ms),
        }
    }
}
