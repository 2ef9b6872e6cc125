use crate::batching::Batch;
use crate::bus::{BusError, BusMessage, MessageBus};
use crate::config::BroadcastConfig;
use crate::location::LocationUpdate;
use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

/// Single-update payload on the emergency channel.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdatedPayload<'a> {
    #[serde(flatten)]
    pub update: &'a LocationUpdate,
    pub batch_id: Uuid,
}

/// Region-wide payload on the bulk channel.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkLocationPayload<'a> {
    pub region_id: &'a str,
    pub updates: Vec<&'a LocationUpdate>,
    pub batch_id: Uuid,
    /// Seal time in epoch milliseconds, stable across retries
    pub timestamp: i64,
}

/// Turns a processed batch into an ordered list of bus messages.
///
/// Every emergency update yields one message on the emergency channel and a
/// one-element bulk message. All of those precede the per-region bulk
/// messages, which carry the remaining updates grouped by region in order
/// of first appearance.
#[derive(Debug, Clone)]
pub struct BroadcastDispatcher {
    emergency_channel: String,
    bulk_channel: String,
}

impl BroadcastDispatcher {
    pub fn new(emergency_channel: impl Into<String>, bulk_channel: impl Into<String>) -> Self {
        Self {
            emergency_channel: emergency_channel.into(),
            bulk_channel: bulk_channel.into(),
        }
    }

    pub fn from_config(config: &BroadcastConfig) -> Self {
        Self::new(config.emergency_channel.clone(), config.bulk_channel.clone())
    }

    pub fn plan(&self, batch: &Batch) -> Result<Vec<BusMessage>, BusError> {
        let timestamp = batch.metadata.sealed_at.timestamp_millis();
        let mut messages = Vec::new();

        let mut regions: Vec<&str> = Vec::new();
        let mut by_region: HashMap<&str, Vec<&LocationUpdate>> = HashMap::new();

        for update in &batch.updates {
            if update.is_emergency() {
                messages.push(BusMessage {
                    channel: self.emergency_channel.clone(),
                    payload: serde_json::to_string(&LocationUpdatedPayload {
                        update,
                        batch_id: batch.batch_id,
                    })?,
                });
                messages.push(BusMessage {
                    channel: self.bulk_channel.clone(),
                    payload: serde_json::to_string(&BulkLocationPayload {
                        region_id: &update.region_id,
                        updates: vec![update],
                        batch_id: batch.batch_id,
                        timestamp,
                    })?,
                });
                continue;
            }

            let region = update.region_id.as_str();
            by_region
                .entry(region)
                .or_insert_with(|| {
                    regions.push(region);
                    Vec::new()
                })
                .push(update);
        }

        for region in regions {
            let updates = by_region.remove(region).unwrap_or_default();
            messages.push(BusMessage {
                channel: self.bulk_channel.clone(),
                payload: serde_json::to_string(&BulkLocationPayload {
                    region_id: region,
                    updates,
                    batch_id: batch.batch_id,
                    timestamp,
                })?,
            });
        }

        Ok(messages)
    }

    /// Publish `messages` starting at `*published`, advancing it after each
    /// successful send so a retry resumes at the first unsent message.
    pub async fn publish(
        &self,
        bus: &dyn MessageBus,
        messages: &[BusMessage],
        published: &mut usize,
    ) -> Result<(), BusError> {
        while let Some(message) = messages.get(*published) {
            let receivers = bus.publish(&message.channel, message.payload.clone()).await?;
            debug!(channel = %message.channel, receivers, "Published location message");
            *published += 1;
        }
        Ok(())
    }
}
