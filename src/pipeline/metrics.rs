use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Counters updated once per completed batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingMetrics {
    pub total_batches: u64,
    pub total_updates: u64,
    pub average_batch_size: f64,
    pub average_processing_time_ms: f64,
    /// Batches dropped after exhausting their retries
    pub error_count: u64,
    pub last_processed_at: Option<DateTime<Utc>>,
}

/// Point-in-time view returned by the metrics accessor.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    #[serde(flatten)]
    pub processing: ProcessingMetrics,
    pub pending_batches: usize,
    pub queue_length: usize,
    pub retry_count: u64,
    pub rejected_updates: u64,
    pub dropped_batches: u64,
    pub trigger_errors: u64,
}

pub struct PipelineMetrics {
    processing: Mutex<ProcessingMetrics>,
    retries: AtomicU64,
    rejected: AtomicU64,
    dropped: AtomicU64,
    trigger_errors: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            processing: Mutex::new(ProcessingMetrics::default()),
            retries: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            trigger_errors: AtomicU64::new(0),
        }
    }

    /// Record a finished batch, successful or exhausted.
    pub fn record_batch(&self, size: usize, elapsed: Duration, succeeded: bool) {
        let mut m = self
            .processing
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        m.total_batches += 1;
        m.total_updates += size as u64;
        m.average_batch_size = m.total_updates as f64 / m.total_batches as f64;

        // Running mean over every completed batch
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        m.average_processing_time_ms +=
            (elapsed_ms - m.average_processing_time_ms) / m.total_batches as f64;

        if !succeeded {
            m.error_count += 1;
        }
        m.last_processed_at = Some(Utc::now());
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_trigger_error(&self) {
        self.trigger_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped_batches(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn processing(&self) -> ProcessingMetrics {
        self.processing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn snapshot(&self, pending_batches: usize, queue_length: usize) -> MetricsSnapshot {
        MetricsSnapshot {
            processing: self.processing(),
            pending_batches,
            queue_length,
            retry_count: self.retries.load(Ordering::Relaxed),
            rejected_updates: self.rejected.load(Ordering::Relaxed),
            dropped_batches: self.dropped.load(Ordering::Relaxed),
            trigger_errors: self.trigger_errors.load(Ordering::Relaxed),
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}
