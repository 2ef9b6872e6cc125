use async_trait::async_trait;
use fleetline::batching::{AddStatus, FlushReason, IngestError};
use fleetline::bus::{BusMessage, LocalBus};
use fleetline::cache::{LocationCache, MemoryCache};
use fleetline::config::Config;
use fleetline::location::{DriverStatus, LocationUpdate, Priority};
use fleetline::pipeline::{LocationPipeline, PipelineBackends};
use fleetline::storage::{DuckDbStorage, LocationStore, StorageError, StoredLocation};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::timeout;

const EMERGENCY: &str = "driver:location_updated";
const BULK: &str = "driver:bulk_location_update";

fn update(driver_id: &str, timestamp: i64) -> LocationUpdate {
    LocationUpdate {
        driver_id: driver_id.to_string(),
        latitude: 40.7128,
        longitude: -74.0060,
        accuracy: Some(4.0),
        bearing: Some(90.0),
        speed: Some(8.0),
        address: None,
        status: DriverStatus::Online,
        is_available: true,
        timestamp,
        region_id: "nyc".to_string(),
        priority: Priority::Normal,
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.batching.max_batch_delay_ms = 200;
    config.batching.priority_batch_delay_ms = 50;
    config.retry.retry_attempts = 3;
    config.retry.retry_delay_ms = 10;
    config.triggers.demand_density.enabled = false;
    config.web.enabled = false;
    config
}

struct Harness {
    pipeline: LocationPipeline,
    store: Arc<dyn LocationStore>,
    cache: Arc<MemoryCache>,
    messages: broadcast::Receiver<BusMessage>,
}

async fn start(config: Config, store: Arc<dyn LocationStore>) -> Harness {
    let cache = Arc::new(MemoryCache::new());
    let bus = Arc::new(LocalBus::new(4096));
    let messages = bus.subscribe_all();

    let pipeline = LocationPipeline::start(
        &config,
        PipelineBackends {
            store: Arc::clone(&store),
            cache: cache.clone(),
            bus,
        },
    )
    .await
    .unwrap();

    Harness {
        pipeline,
        store,
        cache,
        messages,
    }
}

async fn in_memory_store() -> Arc<dyn LocationStore> {
    Arc::new(DuckDbStorage::in_memory().unwrap())
}

async fn next_message(rx: &mut broadcast::Receiver<BusMessage>) -> BusMessage {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a bus message")
        .unwrap()
}

async fn wait_for_batches(pipeline: &LocationPipeline, count: u64) {
    timeout(Duration::from_secs(10), async {
        while pipeline.metrics().processing.total_batches < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for processed batches");
}

fn payload(message: &BusMessage) -> serde_json::Value {
    serde_json::from_str(&message.payload).unwrap()
}

fn driver_ids(bulk: &serde_json::Value) -> Vec<String> {
    bulk["updates"]
        .as_array()
        .unwrap()
        .iter()
        .map(|u| u["driverId"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_last_write_wins_within_window() {
    let mut h = start(test_config(), in_memory_store().await).await;
    let started = Instant::now();

    for ts in [1_000, 2_000, 3_000] {
        h.pipeline.add_update(update("d1", ts)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let message = next_message(&mut h.messages).await;
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(message.channel, BULK);

    let bulk = payload(&message);
    assert_eq!(driver_ids(&bulk), vec!["d1"]);
    assert_eq!(bulk["updates"][0]["timestamp"], 3_000);

    wait_for_batches(&h.pipeline, 1).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(h.messages.try_recv().is_err(), "expected exactly one flush");

    let stored = h.store.get_latest("d1").await.unwrap().unwrap();
    assert_eq!(stored.recorded_at, 3_000);
    assert_eq!(h.store.count_rows().await.unwrap(), 1);

    h.pipeline.shutdown().await.unwrap();
    assert_eq!(h.pipeline.metrics().processing.total_batches, 1);
}

#[tokio::test]
async fn test_out_of_order_update_is_superseded() {
    let mut h = start(test_config(), in_memory_store().await).await;

    h.pipeline.add_update(update("d1", 5_000)).unwrap();
    let outcome = h.pipeline.add_update(update("d1", 4_000)).unwrap();
    assert_eq!(outcome.status, AddStatus::Superseded);

    let bulk = payload(&next_message(&mut h.messages).await);
    assert_eq!(bulk["updates"][0]["timestamp"], 5_000);
    h.pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_emergency_broadcast_precedes_bulk() {
    let mut h = start(test_config(), in_memory_store().await).await;
    let started = Instant::now();

    h.pipeline.add_update(update("d1", 1_000)).unwrap();
    let mut emergency = update("d2", 1_000);
    emergency.priority = Priority::Emergency;
    let outcome = h.pipeline.add_update(emergency).unwrap();
    assert_eq!(outcome.status, AddStatus::Flushed(FlushReason::Emergency));

    let first = next_message(&mut h.messages).await;
    assert!(started.elapsed() < Duration::from_millis(200));
    assert_eq!(first.channel, EMERGENCY);
    assert_eq!(payload(&first)["driverId"], "d2");

    let single = next_message(&mut h.messages).await;
    assert_eq!(single.channel, BULK);
    assert_eq!(driver_ids(&payload(&single)), vec!["d2"]);

    let region = next_message(&mut h.messages).await;
    assert_eq!(region.channel, BULK);
    assert_eq!(driver_ids(&payload(&region)), vec!["d1"]);

    h.pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_size_limit_splits_batches() {
    let mut h = start(test_config(), in_memory_store().await).await;

    let mut statuses = Vec::new();
    for i in 0..501 {
        let outcome = h.pipeline.add_update(update(&format!("driver-{}", i), 1_000)).unwrap();
        statuses.push(outcome.status);
    }
    assert_eq!(statuses[499], AddStatus::Flushed(FlushReason::SizeLimit));
    assert_eq!(statuses[500], AddStatus::Buffered);

    let first = payload(&next_message(&mut h.messages).await);
    assert_eq!(first["updates"].as_array().unwrap().len(), 500);
    let second = payload(&next_message(&mut h.messages).await);
    assert_eq!(driver_ids(&second), vec!["driver-500"]);

    wait_for_batches(&h.pipeline, 2).await;
    let metrics = h.pipeline.metrics();
    assert_eq!(metrics.processing.total_batches, 2);
    assert_eq!(metrics.processing.total_updates, 501);
    assert_eq!(h.store.count_rows().await.unwrap(), 501);

    h.pipeline.shutdown().await.unwrap();
}

/// Fails the first `failures` upserts, then delegates.
struct FlakyStore {
    inner: DuckDbStorage,
    failures: usize,
    calls: AtomicUsize,
    successes: AtomicUsize,
}

impl FlakyStore {
    fn new(failures: usize) -> Self {
        Self {
            inner: DuckDbStorage::in_memory().unwrap(),
            failures,
            calls: AtomicUsize::new(0),
            successes: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl LocationStore for FlakyStore {
    async fn init_schema(&self) -> Result<(), StorageError> {
        self.inner.init_schema().await
    }

    async fn upsert_locations(&self, rows: &[StoredLocation]) -> Result<usize, StorageError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(StorageError::Database("connection refused".to_string()));
        }
        let written = self.inner.upsert_locations(rows).await?;
        self.successes.fetch_add(1, Ordering::SeqCst);
        Ok(written)
    }

    async fn get_latest(&self, driver_id: &str) -> Result<Option<StoredLocation>, StorageError> {
        self.inner.get_latest(driver_id).await
    }

    async fn count_rows(&self) -> Result<u64, StorageError> {
        self.inner.count_rows().await
    }

    async fn purge_expired(&self, now_ms: i64) -> Result<usize, StorageError> {
        self.inner.purge_expired(now_ms).await
    }
}

#[tokio::test]
async fn test_persistence_recovers_after_retries() {
    let flaky = Arc::new(FlakyStore::new(2));
    let mut h = start(test_config(), flaky.clone()).await;

    h.pipeline.add_update(update("d1", 1_000)).unwrap();
    h.pipeline.add_update(update("d2", 1_000)).unwrap();

    let bulk = payload(&next_message(&mut h.messages).await);
    assert_eq!(driver_ids(&bulk), vec!["d1", "d2"]);
    wait_for_batches(&h.pipeline, 1).await;

    let metrics = h.pipeline.metrics();
    assert_eq!(metrics.processing.error_count, 0);
    assert_eq!(metrics.retry_count, 2);
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    assert_eq!(flaky.successes.load(Ordering::SeqCst), 1);
    assert_eq!(h.store.count_rows().await.unwrap(), 2);

    h.pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_exhausted_batch_is_counted_and_dropped() {
    let mut config = test_config();
    config.retry.retry_attempts = 1;
    let flaky = Arc::new(FlakyStore::new(usize::MAX));
    let mut h = start(config, flaky.clone()).await;

    h.pipeline.add_update(update("d1", 1_000)).unwrap();
    wait_for_batches(&h.pipeline, 1).await;

    let metrics = h.pipeline.metrics();
    assert_eq!(metrics.processing.error_count, 1);
    assert_eq!(metrics.retry_count, 1);
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
    assert!(h.messages.try_recv().is_err(), "failed batch must not be broadcast");

    h.pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reprocessing_same_update_is_idempotent() {
    let mut h = start(test_config(), in_memory_store().await).await;

    h.pipeline.add_update(update("d1", 1_000)).unwrap();
    next_message(&mut h.messages).await;
    wait_for_batches(&h.pipeline, 1).await;

    h.pipeline.add_update(update("d1", 1_000)).unwrap();
    next_message(&mut h.messages).await;
    wait_for_batches(&h.pipeline, 2).await;

    assert_eq!(h.store.count_rows().await.unwrap(), 1);
    h.pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_store_round_trip_and_cache_contents() {
    let mut h = start(test_config(), in_memory_store().await).await;

    let mut busy = update("d7", 42_000);
    busy.status = DriverStatus::Busy;
    busy.is_available = false;
    h.pipeline.add_update(busy).unwrap();
    next_message(&mut h.messages).await;
    wait_for_batches(&h.pipeline, 1).await;

    let stored = h.store.get_latest("d7").await.unwrap().unwrap();
    assert_eq!(stored.latitude, 40.7128);
    assert_eq!(stored.longitude, -74.0060);
    assert_eq!(stored.status, DriverStatus::Busy);
    assert!(!stored.is_available);
    assert_eq!(stored.expires_at, 42_000 + 24 * 3600 * 1000);

    assert!(h.cache.get("driver:location:d7").await.unwrap().is_some());
    assert_eq!(h.cache.smembers("status:busy").await.unwrap(), vec!["d7"]);

    h.pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_flushes_pending_batches() {
    let mut config = test_config();
    config.batching.max_batch_delay_ms = 60_000;
    config.batching.priority_batch_delay_ms = 30_000;
    let h = start(config, in_memory_store().await).await;

    h.pipeline.add_update(update("d1", 1_000)).unwrap();
    let mut other = update("d2", 1_000);
    other.region_id = "sf".to_string();
    h.pipeline.add_update(other).unwrap();
    assert_eq!(h.pipeline.metrics().pending_batches, 2);

    h.pipeline.shutdown().await.unwrap();

    let metrics = h.pipeline.metrics();
    assert_eq!(metrics.pending_batches, 0);
    assert_eq!(metrics.queue_length, 0);
    assert_eq!(metrics.processing.total_batches, 2);
    assert_eq!(h.store.count_rows().await.unwrap(), 2);

    assert!(matches!(
        h.pipeline.add_update(update("d3", 2_000)),
        Err(IngestError::ShuttingDown)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_updates_racing_shutdown_are_never_lost() {
    let mut config = test_config();
    config.batching.max_batch_delay_ms = 60_000;
    config.batching.priority_batch_delay_ms = 30_000;
    let h = start(config, in_memory_store().await).await;

    let accepted = Arc::new(AtomicUsize::new(0));
    let producers: Vec<_> = (0..4)
        .map(|t| {
            let pipeline = h.pipeline.clone();
            let accepted = Arc::clone(&accepted);
            std::thread::spawn(move || {
                for i in 0..2_000 {
                    match pipeline.add_update(update(&format!("t{}-d{}", t, i), 1_000)) {
                        Ok(_) => {
                            accepted.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(IngestError::ShuttingDown) => break,
                        Err(e) => panic!("unexpected ingest error: {}", e),
                    }
                }
            })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(2)).await;
    h.pipeline.shutdown().await.unwrap();
    for producer in producers {
        producer.join().unwrap();
    }

    // Every accepted update was flushed and persisted before shutdown returned
    let accepted = accepted.load(Ordering::SeqCst) as u64;
    let metrics = h.pipeline.metrics();
    assert_eq!(metrics.pending_batches, 0);
    assert_eq!(metrics.processing.total_updates, accepted);
    assert_eq!(h.store.count_rows().await.unwrap(), accepted);
}

#[tokio::test]
async fn test_invalid_update_is_rejected_and_counted() {
    let h = start(test_config(), in_memory_store().await).await;

    let mut bad = update("d1", 1_000);
    bad.latitude = 123.0;
    assert!(matches!(
        h.pipeline.add_update(bad),
        Err(IngestError::Validation(_))
    ));

    let metrics = h.pipeline.metrics();
    assert_eq!(metrics.rejected_updates, 1);
    assert_eq!(metrics.pending_batches, 0);

    h.pipeline.shutdown().await.unwrap();
}
