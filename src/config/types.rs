use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub batching: BatchingConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub triggers: TriggersConfig,
    #[serde(default)]
    pub web: WebConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    #[serde(alias = "maxBatchSize")]
    pub max_batch_size: usize,
    #[serde(alias = "maxBatchDelayMs")]
    pub max_batch_delay_ms: u64,
    #[serde(alias = "priorityBatchDelayMs")]
    pub priority_batch_delay_ms: u64,
    #[serde(alias = "enableGeospatialOptimization")]
    pub enable_geospatial_optimization: bool,
    #[serde(alias = "geohashPrecision")]
    pub geohash_precision: usize,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 500,
            max_batch_delay_ms: 1000,
            priority_batch_delay_ms: 100,
            enable_geospatial_optimization: true,
            geohash_precision: 6,
        }
    }
}

impl BatchingConfig {
    pub fn max_batch_delay(&self) -> Duration {
        Duration::from_millis(self.max_batch_delay_ms)
    }

    pub fn priority_batch_delay(&self) -> Duration {
        Duration::from_millis(self.priority_batch_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first failed attempt
    #[serde(alias = "retryAttempts")]
    pub retry_attempts: u32,
    /// Backoff base; retry n waits n times this long
    #[serde(alias = "retryDelayMs")]
    pub retry_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Processing workers; each owns one queue
    pub workers: usize,
    /// Per-queue bound in sealed batches; absent means unbounded
    pub capacity: Option<usize>,
    pub strategy: OverflowStrategy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            capacity: None,
            strategy: OverflowStrategy::WaitForever,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowStrategy {
    /// Ignore the capacity and keep growing
    WaitForever,
    DropOldest,
    DropNewest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: PathBuf,
    /// Added to each row's recorded-at to form its expiry
    #[serde(with = "humantime_serde")]
    pub expiry_horizon: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("fleetline.duckdb"),
            expiry_horizon: Duration::from_secs(24 * 3600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(with = "humantime_serde")]
    pub driver_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            driver_ttl: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    pub emergency_channel: String,
    pub bulk_channel: String,
    pub geofence_channel: String,
    /// Buffered messages per in-process channel
    pub capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            emergency_channel: "driver:location_updated".to_string(),
            bulk_channel: "driver:bulk_location_update".to_string(),
            geofence_channel: "driver:geofence_event".to_string(),
            capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggersConfig {
    pub demand_density: DemandDensityConfig,
    pub geofences: Vec<GeofenceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemandDensityConfig {
    pub enabled: bool,
    /// Geohash length of a density cell
    pub precision: usize,
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl Default for DemandDensityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            precision: 5,
            ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeofenceConfig {
    pub id: String,
    pub region_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub radius_m: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub enabled: bool,
    pub listen: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: "127.0.0.1:8080".to_string(),
        }
    }
}
