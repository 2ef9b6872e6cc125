use crate::batching::batch::{Absorbed, Batch, FlushReason, PendingBatch};
use crate::batching::scheduler::{FlushScheduler, TimerClass};
use crate::location::{BatchKey, KeyDeriver, LocationUpdate, ValidationError};
use crate::pipeline::metrics::PipelineMetrics;
use crate::pipeline::queue::QueueRouter;
use dashmap::mapref::entry::{Entry, OccupiedEntry};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid location update: {0}")]
    Validation(#[from] ValidationError),

    #[error("pipeline is shutting down")]
    ShuttingDown,
}

/// What `add_update` did with an accepted update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddOutcome {
    pub key: BatchKey,
    pub batch_id: Uuid,
    pub status: AddStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AddStatus {
    /// Waiting in a pending batch for its flush timer
    Buffered,
    /// A newer fix for the same driver was already pending
    Superseded,
    /// The update sealed its batch immediately
    Flushed(FlushReason),
}

pub struct AccumulatorSettings {
    pub deriver: KeyDeriver,
    pub max_batch_size: usize,
}

/// Per-key pending batches with their flush timers.
///
/// Each key's state lives in one DashMap shard. Ingestion takes that shard
/// lock plus a shared read of the accepting flag, and neither is held
/// across an await.
#[derive(Clone)]
pub struct BatchAccumulator {
    inner: Arc<Inner>,
}

struct Inner {
    pending: DashMap<BatchKey, PendingBatch>,
    deriver: KeyDeriver,
    max_batch_size: usize,
    scheduler: FlushScheduler,
    sink: Arc<QueueRouter>,
    metrics: Arc<PipelineMetrics>,
    /// Read-held by every `add_update`, write-held to stop ingestion
    accepting: RwLock<bool>,
}

impl BatchAccumulator {
    pub fn new(
        settings: AccumulatorSettings,
        scheduler: FlushScheduler,
        sink: Arc<QueueRouter>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: DashMap::new(),
                deriver: settings.deriver,
                max_batch_size: settings.max_batch_size.max(1),
                scheduler,
                sink,
                metrics,
                accepting: RwLock::new(true),
            }),
        }
    }

    /// Merge one update into its pending batch. Never performs I/O.
    pub fn add_update(&self, update: LocationUpdate) -> Result<AddOutcome, IngestError> {
        let inner = &self.inner;

        // Held for the whole merge so shutdown cannot interleave with it
        let accepting = inner.accepting.read().unwrap_or_else(PoisonError::into_inner);
        if !*accepting {
            return Err(IngestError::ShuttingDown);
        }

        if let Err(e) = update.validate() {
            inner.metrics.record_rejected();
            warn!(
                driver_id = %update.driver_id,
                region_id = %update.region_id,
                error = %e,
                "Rejected location update"
            );
            return Err(e.into());
        }

        let key = inner
            .deriver
            .derive(&update.region_id, update.latitude, update.longitude);

        // The flush decision and the seal share one shard lock
        let merged = match inner.pending.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let merged = inner.merge(&key, entry.get_mut(), update);
                if let Some(reason) = merged.flush {
                    inner.seal_entry(entry, reason);
                }
                merged
            }
            Entry::Vacant(entry) => {
                let mut pending = PendingBatch::new(key.clone(), update.region_id.clone());
                let merged = inner.merge(&key, &mut pending, update);
                match merged.flush {
                    Some(reason) => inner.enqueue(pending.seal(reason)),
                    None => {
                        entry.insert(pending);
                    }
                }
                merged
            }
        };
        drop(accepting);

        let status = match merged.flush {
            Some(reason) => AddStatus::Flushed(reason),
            None if merged.absorbed == Absorbed::Stale => AddStatus::Superseded,
            None => AddStatus::Buffered,
        };

        Ok(AddOutcome {
            key,
            batch_id: merged.batch_id,
            status,
        })
    }

    /// Seal one key's pending batch now, if there is one.
    pub fn flush_key(&self, key: &BatchKey, reason: FlushReason) -> bool {
        self.inner.seal(key, None, reason)
    }

    /// Seal every pending batch. Returns the number sealed.
    pub fn flush_all(&self, reason: FlushReason) -> usize {
        let keys: Vec<BatchKey> = self
            .inner
            .pending
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        keys.iter()
            .filter(|key| self.inner.seal(key, None, reason))
            .count()
    }

    /// Stop accepting updates; pending batches stay until flushed.
    ///
    /// Waits for in-flight `add_update` calls, so a following `flush_all`
    /// sees every batch that will ever be pending.
    pub fn stop_accepting(&self) {
        *self
            .inner
            .accepting
            .write()
            .unwrap_or_else(PoisonError::into_inner) = false;
    }

    pub fn pending_batches(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn pending_size(&self, key: &BatchKey) -> Option<usize> {
        self.inner.pending.get(key).map(|p| p.len())
    }
}

impl Inner {
    fn arm_timer(
        self: &Arc<Self>,
        key: BatchKey,
        batch_id: Uuid,
        class: TimerClass,
    ) -> crate::batching::scheduler::FlushTimer {
        let weak: Weak<Inner> = Arc::downgrade(self);
        self.scheduler.arm(class, move || {
            if let Some(inner) = weak.upgrade() {
                inner.seal(&key, Some(batch_id), FlushReason::Timer);
            }
        })
    }

    /// Absorb `update` and decide whether the batch seals now. Arms or
    /// tightens the flush timer when it does not.
    fn merge(
        self: &Arc<Self>,
        key: &BatchKey,
        pending: &mut PendingBatch,
        update: LocationUpdate,
    ) -> Merged {
        let emergency = update.is_emergency();
        let absorbed = pending.absorb(update);
        let batch_id = pending.batch_id();

        let flush = if emergency {
            Some(FlushReason::Emergency)
        } else if pending.len() >= self.max_batch_size {
            Some(FlushReason::SizeLimit)
        } else {
            None
        };

        if flush.is_none() {
            let class = if pending.has_elevated() {
                TimerClass::Priority
            } else {
                TimerClass::Routine
            };
            let arm = match pending.timer() {
                None => true,
                // A routine timer is tightened once when the first elevated update joins
                Some(timer) => {
                    timer.class() == TimerClass::Routine
                        && class == TimerClass::Priority
                        && self.scheduler.would_tighten(timer, class)
                }
            };
            if arm {
                let timer = self.arm_timer(key.clone(), batch_id, class);
                pending.set_timer(timer);
            }
        }

        Merged {
            batch_id,
            absorbed,
            flush,
        }
    }

    /// Seal by key, for timers and explicit flushes.
    ///
    /// With `expected` set, only that batch generation may be sealed.
    fn seal(&self, key: &BatchKey, expected: Option<Uuid>, reason: FlushReason) -> bool {
        let Entry::Occupied(entry) = self.pending.entry(key.clone()) else {
            return false;
        };
        if let Some(expected) = expected {
            if entry.get().batch_id() != expected {
                return false;
            }
        }
        self.seal_entry(entry, reason);
        true
    }

    /// Remove, cancel and enqueue while the caller's shard lock is held,
    /// so two seals of the same key always reach the queue in seal order.
    fn seal_entry(
        &self,
        mut entry: OccupiedEntry<'_, BatchKey, PendingBatch>,
        reason: FlushReason,
    ) {
        let batch = entry.get_mut().seal(reason);
        self.enqueue(batch);
        entry.remove();
    }

    fn enqueue(&self, batch: Batch) {
        debug!(
            batch_id = %batch.batch_id,
            key = %batch.key,
            size = batch.len(),
            reason = ?batch.metadata.flush_reason,
            "Sealed batch"
        );
        self.sink.push(batch);
    }
}

struct Merged {
    batch_id: Uuid,
    absorbed: Absorbed,
    flush: Option<FlushReason>,
}
