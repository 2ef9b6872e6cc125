use crate::batching::Batch;
use crate::bus::{BusError, BusMessage, MessageBus};
use crate::cache::{
    driver_location_key, region_drivers_key, status_key, CacheError, CachePipeline, LocationCache,
};
use crate::pipeline::broadcast::BroadcastDispatcher;
use crate::storage::{LocationStore, StorageError, StoredLocation};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// A failure in one of the retried stages.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("persistence failed: {0}")]
    Persistence(#[from] StorageError),

    #[error("cache update failed: {0}")]
    Cache(#[from] CacheError),

    #[error("broadcast failed: {0}")]
    Broadcast(#[from] BusError),
}

impl StageError {
    pub fn stage(&self) -> &'static str {
        match self {
            StageError::Persistence(_) => "persistence",
            StageError::Cache(_) => "cache",
            StageError::Broadcast(_) => "broadcast",
        }
    }
}

/// How far a batch has come through the retried stages. Kept across
/// attempts so a retry resumes where the previous attempt failed.
#[derive(Debug, Default)]
pub struct StageProgress {
    pub persisted: bool,
    pub cached: bool,
    /// Messages already published from `messages`
    pub published: usize,
    messages: Option<Vec<BusMessage>>,
}

impl StageProgress {
    pub fn is_complete(&self) -> bool {
        self.persisted
            && self.cached
            && self
                .messages
                .as_ref()
                .is_some_and(|m| self.published >= m.len())
    }
}

#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    /// Added to recorded-at to form each row's expiry
    pub expiry_horizon: Duration,
    pub driver_ttl: Duration,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            expiry_horizon: Duration::from_secs(24 * 3600),
            driver_ttl: Duration::from_secs(3600),
        }
    }
}

/// Runs persistence, cache update and broadcast for one batch.
pub struct BatchProcessor {
    store: Arc<dyn LocationStore>,
    cache: Arc<dyn LocationCache>,
    bus: Arc<dyn MessageBus>,
    dispatcher: BroadcastDispatcher,
    settings: ProcessorSettings,
}

impl BatchProcessor {
    pub fn new(
        store: Arc<dyn LocationStore>,
        cache: Arc<dyn LocationCache>,
        bus: Arc<dyn MessageBus>,
        dispatcher: BroadcastDispatcher,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            store,
            cache,
            bus,
            dispatcher,
            settings,
        }
    }

    /// Run every stage not yet marked done in `progress`.
    pub async fn process(&self, batch: &Batch, progress: &mut StageProgress) -> Result<(), StageError> {
        if !progress.persisted {
            let rows = self.persist(batch).await?;
            progress.persisted = true;
            debug!(batch_id = %batch.batch_id, rows, "Persisted batch");
        }

        if !progress.cached {
            self.update_cache(batch).await?;
            progress.cached = true;
            debug!(batch_id = %batch.batch_id, "Cached batch");
        }

        if progress.messages.is_none() {
            progress.messages = Some(self.dispatcher.plan(batch)?);
        }
        if let Some(messages) = progress.messages.as_deref() {
            self.dispatcher
                .publish(self.bus.as_ref(), messages, &mut progress.published)
                .await?;
        }

        Ok(())
    }

    /// One bulk upsert for the whole batch.
    pub async fn persist(&self, batch: &Batch) -> Result<usize, StageError> {
        let rows: Vec<StoredLocation> = batch
            .updates
            .iter()
            .map(|u| StoredLocation::from_update(u, self.settings.expiry_horizon))
            .collect();
        Ok(self.store.upsert_locations(&rows).await?)
    }

    /// One pipelined round trip: driver entry, region geo index and status set.
    pub async fn update_cache(&self, batch: &Batch) -> Result<(), StageError> {
        let mut pipeline = CachePipeline::new();
        for update in &batch.updates {
            let value = serde_json::to_string(update).map_err(CacheError::from)?;
            pipeline
                .set_ex(driver_location_key(&update.driver_id), value, self.settings.driver_ttl)
                .geo_add(
                    region_drivers_key(&update.region_id),
                    update.driver_id.clone(),
                    update.longitude,
                    update.latitude,
                )
                .sadd(status_key(&update.status), update.driver_id.clone());
        }
        self.cache.execute(pipeline).await?;
        Ok(())
    }
}
