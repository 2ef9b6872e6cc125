use super::traits::{LocationStore, StorageError, StoredLocation};
use crate::location::DriverStatus;
use async_trait::async_trait;
use duckdb::types::Value;
use duckdb::{params, params_from_iter, Connection};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

const COLUMNS: [&str; 12] = [
    "driver_id",
    "latitude",
    "longitude",
    "accuracy",
    "bearing",
    "speed",
    "address",
    "region_id",
    "status",
    "is_available",
    "recorded_at",
    "expires_at",
];

/// Columns overwritten when a row with the same key already exists.
const UPDATED_ON_CONFLICT: [&str; 10] = [
    "latitude",
    "longitude",
    "accuracy",
    "bearing",
    "speed",
    "address",
    "region_id",
    "status",
    "is_available",
    "expires_at",
];

/// PID of the process holding a DuckDB file lock, from the open error text.
fn lock_holder_pid(error_msg: &str) -> Option<u32> {
    let start = error_msg.find("(PID ")? + 5;
    let end = error_msg[start..].find(')')?;
    error_msg[start..start + end].parse().ok()
}

fn process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // ps exits non-zero when the PID is unknown
        std::process::Command::new("ps")
            .arg("-p")
            .arg(pid.to_string())
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        // Assume the holder is alive so its files are never removed
        let _ = pid;
        true
    }
}

fn remove_stale_lock_files(db_path: &Path) -> std::io::Result<()> {
    for suffix in ["wal", "lock"] {
        let path = PathBuf::from(format!("{}.{}", db_path.display(), suffix));
        if path.exists() {
            std::fs::remove_file(&path)?;
            tracing::info!(path = %path.display(), "Removed stale database file");
        }
    }
    Ok(())
}

fn upsert_sql(rows: usize) -> String {
    let row = format!("({})", vec!["?"; COLUMNS.len()].join(", "));
    let values = vec![row.as_str(); rows].join(", ");
    let updates = UPDATED_ON_CONFLICT
        .iter()
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "INSERT INTO driver_locations ({}) VALUES {} \
         ON CONFLICT (driver_id, recorded_at) DO UPDATE SET {}",
        COLUMNS.join(", "),
        values,
        updates
    )
}

fn optional_double(v: Option<f64>) -> Value {
    v.map_or(Value::Null, Value::Double)
}

fn row_values(row: &StoredLocation, out: &mut Vec<Value>) {
    out.push(Value::Text(row.driver_id.clone()));
    out.push(Value::Double(row.latitude));
    out.push(Value::Double(row.longitude));
    out.push(optional_double(row.accuracy));
    out.push(optional_double(row.bearing));
    out.push(optional_double(row.speed));
    out.push(row.address.clone().map_or(Value::Null, Value::Text));
    out.push(Value::Text(row.region_id.clone()));
    out.push(Value::Text(row.status.as_str().to_string()));
    out.push(Value::Boolean(row.is_available));
    out.push(Value::BigInt(row.recorded_at));
    out.push(Value::BigInt(row.expires_at));
}

/// DuckDB implementation of the LocationStore trait
pub struct DuckDbStorage {
    conn: Arc<Mutex<Connection>>,
}

impl DuckDbStorage {
    /// Open (or create) a database file, clearing lock files left by a dead process.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();

        // First attempt to open the connection
        match Connection::open(path) {
            Ok(conn) => Ok(Self::from_connection(conn)),
            Err(e) => {
                let error_msg = e.to_string();
                // Only lock errors are recoverable
                if !error_msg.contains("Could not set lock") {
                    return Err(e.into());
                }

                tracing::warn!(error = %error_msg, "Database lock detected");
                match lock_holder_pid(&error_msg) {
                    Some(pid) if !process_alive(pid) => {
                        tracing::warn!(pid, "Lock holder is gone, removing stale lock files");
                        remove_stale_lock_files(path)
                            .map_err(|io| StorageError::Database(io.to_string()))?;
                        // Retry opening the connection
                        Ok(Self::from_connection(Connection::open(path)?))
                    }
                    Some(pid) => {
                        tracing::error!(pid, "Database is locked by a running process");
                        Err(e.into())
                    }
                    None => Err(e.into()),
                }
            }
        }
    }

    /// Create an in-memory DuckDB storage instance (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = self.conn.clone();
        // DuckDB calls block, so run them off the async workers
        tokio::task::spawn_blocking(move || {
            let guard: MutexGuard<'_, Connection> = conn
                .lock()
                .map_err(|_| StorageError::Database("connection mutex poisoned".to_string()))?;
            f(&*guard)
        })
        .await
        .map_err(|e| StorageError::Database(format!("Task join error: {}", e)))?
    }
}

#[async_trait]
impl LocationStore for DuckDbStorage {
    async fn init_schema(&self) -> Result<(), StorageError> {
        self.with_conn(|conn| {
            // Create driver_locations table
            conn.execute(
                "CREATE TABLE IF NOT EXISTS driver_locations (
                    driver_id VARCHAR NOT NULL,
                    latitude DOUBLE NOT NULL,
                    longitude DOUBLE NOT NULL,
                    accuracy DOUBLE,
                    bearing DOUBLE,
                    speed DOUBLE,
                    address VARCHAR,
                    region_id VARCHAR NOT NULL,
                    status VARCHAR NOT NULL,
                    is_available BOOLEAN NOT NULL,
                    recorded_at BIGINT NOT NULL,
                    expires_at BIGINT NOT NULL,
                    PRIMARY KEY (driver_id, recorded_at)
                )",
                [],
            )?;

            // No secondary indexes: DuckDB refuses ON CONFLICT DO UPDATE on indexed columns
            Ok(())
        })
        .await
    }

    async fn upsert_locations(&self, rows: &[StoredLocation]) -> Result<usize, StorageError> {
        if rows.is_empty() {
            return Ok(0);
        }

        // One statement with a VALUES tuple per row
        let sql = upsert_sql(rows.len());
        let mut values = Vec::with_capacity(rows.len() * COLUMNS.len());
        for row in rows {
            row_values(row, &mut values);
        }

        self.with_conn(move |conn| Ok(conn.execute(&sql, params_from_iter(values))?))
            .await
    }

    async fn get_latest(&self, driver_id: &str) -> Result<Option<StoredLocation>, StorageError> {
        let driver_id = driver_id.to_string();

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT driver_id, latitude, longitude, accuracy, bearing, speed, address,
                        region_id, status, is_available, recorded_at, expires_at
                 FROM driver_locations
                 WHERE driver_id = ?
                 ORDER BY recorded_at DESC
                 LIMIT 1",
            )?;

            let mut rows = stmt.query(params![driver_id])?;
            // No row means the driver was never persisted
            let Some(row) = rows.next()? else {
                return Ok(None);
            };

            let status_text: String = row.get(8)?;
            let status = DriverStatus::from(status_text);

            Ok(Some(StoredLocation {
                driver_id: row.get(0)?,
                latitude: row.get(1)?,
                longitude: row.get(2)?,
                accuracy: row.get(3)?,
                bearing: row.get(4)?,
                speed: row.get(5)?,
                address: row.get(6)?,
                region_id: row.get(7)?,
                status,
                is_available: row.get(9)?,
                recorded_at: row.get(10)?,
                expires_at: row.get(11)?,
            }))
        })
        .await
    }

    async fn count_rows(&self) -> Result<u64, StorageError> {
        self.with_conn(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM driver_locations", [], |row| row.get(0))?;
            Ok(count.max(0) as u64)
        })
        .await
    }

    async fn purge_expired(&self, now_ms: i64) -> Result<usize, StorageError> {
        self.with_conn(move |conn| {
            Ok(conn.execute(
                "DELETE FROM driver_locations WHERE expires_at <= ?",
                params![now_ms],
            )?)
        })
        .await
    }
}
