use crate::batching::{AccumulatorSettings, AddOutcome, BatchAccumulator, FlushReason, FlushScheduler, IngestError};
use crate::bus::MessageBus;
use crate::cache::LocationCache;
use crate::config::Config;
use crate::location::{KeyDeriver, LocationUpdate};
use crate::pipeline::broadcast::BroadcastDispatcher;
use crate::pipeline::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::pipeline::processor::{BatchProcessor, ProcessorSettings};
use crate::pipeline::queue::QueueRouter;
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::triggers::{BatchTrigger, DemandDensityTrigger, GeofenceTrigger, TriggerSet};
use crate::pipeline::worker::{run_worker, WorkerContext};
use crate::storage::{LocationStore, StorageError};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Errors that can occur while starting or stopping the pipeline
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline must be started from within a tokio runtime")]
    NoRuntime,

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// The external systems the pipeline writes to.
#[derive(Clone)]
pub struct PipelineBackends {
    pub store: Arc<dyn LocationStore>,
    pub cache: Arc<dyn LocationCache>,
    pub bus: Arc<dyn MessageBus>,
}

/// Handle to a running location pipeline.
///
/// `add_update` may be called concurrently from any thread. Dropping the
/// handle without `shutdown` abandons pending batches.
#[derive(Clone)]
pub struct LocationPipeline {
    accumulator: BatchAccumulator,
    router: Arc<QueueRouter>,
    metrics: Arc<PipelineMetrics>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl LocationPipeline {
    /// Start with the triggers named in the config.
    pub async fn start(config: &Config, backends: PipelineBackends) -> Result<Self, PipelineError> {
        let mut triggers: Vec<Arc<dyn BatchTrigger>> = Vec::new();
        if config.triggers.demand_density.enabled {
            triggers.push(Arc::new(DemandDensityTrigger::new(
                Arc::clone(&backends.cache),
                &config.triggers.demand_density,
            )));
        }
        if !config.triggers.geofences.is_empty() {
            triggers.push(Arc::new(GeofenceTrigger::new(
                Arc::clone(&backends.bus),
                config.broadcast.geofence_channel.clone(),
                config.triggers.geofences.clone(),
            )));
        }
        Self::start_with_triggers(config, backends, triggers).await
    }

    pub async fn start_with_triggers(
        config: &Config,
        backends: PipelineBackends,
        triggers: Vec<Arc<dyn BatchTrigger>>,
    ) -> Result<Self, PipelineError> {
        let runtime = Handle::try_current().map_err(|_| PipelineError::NoRuntime)?;

        backends.store.init_schema().await?;

        let metrics = Arc::new(PipelineMetrics::new());
        let router = Arc::new(QueueRouter::new(
            config.queue.workers,
            config.queue.capacity,
            config.queue.strategy,
            Arc::clone(&metrics),
        ));

        let trigger_set = triggers
            .into_iter()
            .fold(TriggerSet::new(Arc::clone(&metrics)), TriggerSet::with_trigger);

        let ctx = Arc::new(WorkerContext {
            processor: BatchProcessor::new(
                backends.store,
                backends.cache,
                backends.bus,
                BroadcastDispatcher::from_config(&config.broadcast),
                ProcessorSettings {
                    expiry_horizon: config.storage.expiry_horizon,
                    driver_ttl: config.cache.driver_ttl,
                },
            ),
            policy: RetryPolicy::from_config(&config.retry),
            triggers: trigger_set,
            metrics: Arc::clone(&metrics),
        });

        let workers = router
            .queues()
            .iter()
            .enumerate()
            .map(|(id, queue)| runtime.spawn(run_worker(id, Arc::clone(queue), Arc::clone(&ctx))))
            .collect();

        let scheduler = FlushScheduler::new(
            runtime,
            config.batching.max_batch_delay(),
            config.batching.priority_batch_delay(),
        );
        let accumulator = BatchAccumulator::new(
            AccumulatorSettings {
                deriver: KeyDeriver::new(
                    config.batching.enable_geospatial_optimization,
                    config.batching.geohash_precision,
                ),
                max_batch_size: config.batching.max_batch_size,
            },
            scheduler,
            Arc::clone(&router),
            Arc::clone(&metrics),
        );

        info!(
            workers = config.queue.workers,
            max_batch_size = config.batching.max_batch_size,
            max_batch_delay_ms = config.batching.max_batch_delay_ms,
            geospatial = config.batching.enable_geospatial_optimization,
            "Location pipeline started"
        );

        Ok(Self {
            accumulator,
            router,
            metrics,
            workers: Arc::new(Mutex::new(workers)),
        })
    }

    /// Hand one update to the batching layer. Never waits on I/O.
    pub fn add_update(&self, update: LocationUpdate) -> Result<AddOutcome, IngestError> {
        self.accumulator.add_update(update)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics
            .snapshot(self.accumulator.pending_batches(), self.router.len())
    }

    /// Seal every pending batch now. Returns how many were sealed.
    pub fn flush_all(&self) -> usize {
        self.accumulator.flush_all(FlushReason::Shutdown)
    }

    /// Stop accepting updates, flush pending batches and wait until the
    /// workers have drained their queues.
    pub async fn shutdown(&self) -> Result<(), PipelineError> {
        self.accumulator.stop_accepting();
        let flushed = self.accumulator.flush_all(FlushReason::Shutdown);
        self.router.close();
        info!(flushed, "Draining processing queues");

        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let mut result = Ok(());
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Processing worker failed");
                result = Err(e.into());
            }
        }

        let snapshot = self.metrics();
        info!(
            total_batches = snapshot.processing.total_batches,
            total_updates = snapshot.processing.total_updates,
            error_count = snapshot.processing.error_count,
            "Location pipeline stopped"
        );
        result
    }
}
