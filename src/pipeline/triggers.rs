//! Best-effort work run after a batch has been processed.
//!
//! Trigger failures and panics are logged and counted; they never feed back
//! into the batch's retry loop.

use crate::batching::Batch;
use crate::bus::{BusError, MessageBus};
use crate::cache::{demand_density_key, CacheError, CachePipeline, LocationCache};
use crate::config::{DemandDensityConfig, GeofenceConfig};
use crate::location::geohash;
use crate::location::{DriverId, RegionId};
use crate::pipeline::metrics::PipelineMetrics;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("failed to encode trigger payload: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait BatchTrigger: Send + Sync {
    fn name(&self) -> &str;

    async fn on_batch(&self, batch: &Batch) -> Result<(), TriggerError>;
}

/// Spawns every registered trigger for each processed batch.
pub struct TriggerSet {
    triggers: Vec<Arc<dyn BatchTrigger>>,
    metrics: Arc<PipelineMetrics>,
}

impl TriggerSet {
    pub fn new(metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            triggers: Vec::new(),
            metrics,
        }
    }

    pub fn with_trigger(mut self, trigger: Arc<dyn BatchTrigger>) -> Self {
        self.triggers.push(trigger);
        self
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    /// Run each trigger on its own task, watched by a supervisor task that
    /// reports errors and panics. The returned handles finish once the
    /// supervisors have.
    pub fn spawn_all(&self, batch: Arc<Batch>) -> Vec<JoinHandle<()>> {
        self.triggers
            .iter()
            .map(|trigger| {
                let trigger = Arc::clone(trigger);
                let batch = Arc::clone(&batch);
                let metrics = Arc::clone(&self.metrics);

                tokio::spawn(async move {
                    let name = trigger.name().to_string();
                    let batch_id = batch.batch_id;
                    let task = tokio::spawn(async move { trigger.on_batch(&batch).await });

                    match task.await {
                        Ok(Ok(())) => debug!(trigger = %name, batch_id = %batch_id, "Trigger completed"),
                        Ok(Err(e)) => {
                            metrics.record_trigger_error();
                            warn!(trigger = %name, batch_id = %batch_id, error = %e, "Trigger failed");
                        }
                        Err(e) => {
                            metrics.record_trigger_error();
                            warn!(trigger = %name, batch_id = %batch_id, error = %e, "Trigger task aborted");
                        }
                    }
                })
            })
            .collect()
    }
}

/// Counts available drivers per geohash cell for each region touched by a
/// batch and caches the counts under `demand:density:<regionId>`.
pub struct DemandDensityTrigger {
    cache: Arc<dyn LocationCache>,
    precision: usize,
    ttl: Duration,
    /// Latest cell of every available driver, per region
    cells: DashMap<RegionId, HashMap<DriverId, String>>,
}

impl DemandDensityTrigger {
    pub fn new(cache: Arc<dyn LocationCache>, config: &DemandDensityConfig) -> Self {
        Self {
            cache,
            precision: config.precision,
            ttl: config.ttl,
            cells: DashMap::new(),
        }
    }

    /// Fold the batch into the per-region cell map and return the counts of
    /// every region it touched.
    fn fold(&self, batch: &Batch) -> Vec<(RegionId, BTreeMap<String, u32>)> {
        let mut touched: Vec<RegionId> = Vec::new();

        for update in &batch.updates {
            let mut region = self.cells.entry(update.region_id.clone()).or_default();
            if update.is_available {
                let cell = geohash::encode(update.latitude, update.longitude, self.precision);
                region.insert(update.driver_id.clone(), cell);
            } else {
                region.remove(&update.driver_id);
            }
            if !touched.contains(&update.region_id) {
                touched.push(update.region_id.clone());
            }
        }

        touched
            .into_iter()
            .map(|region_id| {
                let mut counts = BTreeMap::new();
                if let Some(region) = self.cells.get(&region_id) {
                    for cell in region.values() {
                        *counts.entry(cell.clone()).or_insert(0) += 1;
                    }
                }
                (region_id, counts)
            })
            .collect()
    }
}

#[async_trait]
impl BatchTrigger for DemandDensityTrigger {
    fn name(&self) -> &str {
        "demand_density"
    }

    async fn on_batch(&self, batch: &Batch) -> Result<(), TriggerError> {
        let mut pipeline = CachePipeline::new();
        for (region_id, counts) in self.fold(batch) {
            pipeline.set_ex(
                demand_density_key(&region_id),
                serde_json::to_string(&counts)?,
                self.ttl,
            );
        }
        if !pipeline.is_empty() {
            self.cache.execute(pipeline).await?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GeofenceTransition {
    Enter,
    Exit,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeofenceEvent<'a> {
    pub geofence_id: &'a str,
    pub driver_id: &'a str,
    pub region_id: &'a str,
    pub event: GeofenceTransition,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: i64,
    pub batch_id: Uuid,
}

/// Publishes enter/exit events for drivers crossing circular geofences.
pub struct GeofenceTrigger {
    bus: Arc<dyn MessageBus>,
    channel: String,
    fences: Vec<GeofenceConfig>,
    /// `(fence id, driver id)` pairs currently inside
    inside: DashSet<(String, DriverId)>,
}

impl GeofenceTrigger {
    pub fn new(bus: Arc<dyn MessageBus>, channel: impl Into<String>, fences: Vec<GeofenceConfig>) -> Self {
        Self {
            bus,
            channel: channel.into(),
            fences,
            inside: DashSet::new(),
        }
    }
}

#[async_trait]
impl BatchTrigger for GeofenceTrigger {
    fn name(&self) -> &str {
        "geofence"
    }

    async fn on_batch(&self, batch: &Batch) -> Result<(), TriggerError> {
        for update in &batch.updates {
            for fence in self.fences.iter().filter(|f| f.region_id == update.region_id) {
                let distance = haversine_m(
                    fence.latitude,
                    fence.longitude,
                    update.latitude,
                    update.longitude,
                );
                let member = (fence.id.clone(), update.driver_id.clone());

                let transition = if distance <= fence.radius_m {
                    self.inside.insert(member).then_some(GeofenceTransition::Enter)
                } else {
                    self.inside.remove(&member).map(|_| GeofenceTransition::Exit)
                };
                let Some(event) = transition else {
                    continue;
                };

                let payload = serde_json::to_string(&GeofenceEvent {
                    geofence_id: &fence.id,
                    driver_id: &update.driver_id,
                    region_id: &update.region_id,
                    event,
                    latitude: update.latitude,
                    longitude: update.longitude,
                    timestamp: update.timestamp,
                    batch_id: batch.batch_id,
                })?;
                self.bus.publish(&self.channel, payload).await?;
            }
        }
        Ok(())
    }
}

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in metres.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().asin()
}
