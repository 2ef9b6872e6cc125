//! Publish/subscribe fan-out of processed location data.
//!
//! Channel payloads are JSON strings. Subscribers must order updates by the
//! embedded `timestamp`; delivery order across channels is not guaranteed by
//! remote buses.

pub mod local;

pub use local::LocalBus;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusMessage {
    pub channel: String,
    pub payload: String,
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish one payload. Returns the number of subscribers reached.
    async fn publish(&self, channel: &str, payload: String) -> Result<usize, BusError>;
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus unavailable: {0}")]
    Unavailable(String),

    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}
