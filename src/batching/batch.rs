use crate::batching::scheduler::{FlushTimer, TimerClass};
use crate::location::{BatchKey, DriverId, LocationUpdate, Priority, RegionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A sealed group of location updates handed to the processing pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    /// Unique batch ID
    pub batch_id: Uuid,

    /// When the first update for this batch arrived
    pub created_at: DateTime<Utc>,

    pub region_id: RegionId,

    /// Key the batch was accumulated under
    pub key: BatchKey,

    /// At most one entry per driver, in order of first arrival
    pub updates: Vec<LocationUpdate>,

    pub metadata: BatchMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchMetadata {
    pub size: usize,

    /// Highest priority among the contained updates
    pub priority: Priority,

    /// Filled in by the worker once stages 1-3 have completed
    pub processing_time_ms: Option<u64>,

    pub flush_reason: FlushReason,

    pub sealed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushReason {
    Timer,
    Emergency,
    SizeLimit,
    Shutdown,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}

/// Result of merging one update into a pending batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Absorbed {
    /// First update for this driver in the batch
    Inserted,
    /// Replaced an entry with an older or equal timestamp
    Replaced,
    /// Older than the stored entry; discarded
    Stale,
}

/// Mutable state of a batch that has not been sealed yet.
pub struct PendingBatch {
    batch_id: Uuid,
    created_at: DateTime<Utc>,
    region_id: RegionId,
    key: BatchKey,
    updates: Vec<LocationUpdate>,
    index: HashMap<DriverId, usize>,
    elevated: usize,
    timer: Option<FlushTimer>,
}

impl PendingBatch {
    pub fn new(key: BatchKey, region_id: RegionId) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            created_at: Utc::now(),
            region_id,
            key,
            updates: Vec::new(),
            index: HashMap::new(),
            elevated: 0,
            timer: None,
        }
    }

    pub fn batch_id(&self) -> Uuid {
        self.batch_id
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// True while any stored entry is high or emergency priority.
    pub fn has_elevated(&self) -> bool {
        self.elevated > 0
    }

    /// Last-write-wins by the update's own timestamp; ties go to the newcomer.
    pub fn absorb(&mut self, update: LocationUpdate) -> Absorbed {
        match self.index.get(&update.driver_id) {
            Some(&slot) => {
                let stored = &mut self.updates[slot];
                if update.timestamp < stored.timestamp {
                    return Absorbed::Stale;
                }
                if stored.priority.is_elevated() {
                    self.elevated -= 1;
                }
                if update.priority.is_elevated() {
                    self.elevated += 1;
                }
                *stored = update;
                Absorbed::Replaced
            }
            None => {
                if update.priority.is_elevated() {
                    self.elevated += 1;
                }
                self.index.insert(update.driver_id.clone(), self.updates.len());
                self.updates.push(update);
                Absorbed::Inserted
            }
        }
    }

    pub fn timer_class(&self) -> Option<TimerClass> {
        self.timer.as_ref().map(|t| t.class())
    }

    pub fn timer(&self) -> Option<&FlushTimer> {
        self.timer.as_ref()
    }

    /// Install a timer, cancelling any previous one.
    pub fn set_timer(&mut self, timer: FlushTimer) {
        if let Some(previous) = self.timer.replace(timer) {
            previous.cancel();
        }
    }

    /// Cancel the timer and move the contents out into a sealed batch.
    pub fn seal(&mut self, reason: FlushReason) -> Batch {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }

        let updates = std::mem::take(&mut self.updates);
        self.index.clear();
        self.elevated = 0;

        let priority = updates
            .iter()
            .map(|u| u.priority)
            .max()
            .unwrap_or_default();

        Batch {
            batch_id: self.batch_id,
            created_at: self.created_at,
            region_id: self.region_id.clone(),
            key: self.key.clone(),
            metadata: BatchMetadata {
                size: updates.len(),
                priority,
                processing_time_ms: None,
                flush_reason: reason,
                sealed_at: Utc::now(),
            },
            updates,
        }
    }
}
