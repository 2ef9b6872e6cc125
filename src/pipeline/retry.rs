use crate::batching::Batch;
use crate::config::RetryConfig;
use crate::location::BatchKey;
use crate::pipeline::metrics::PipelineMetrics;
use crate::pipeline::processor::{BatchProcessor, StageError, StageProgress};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// Linear backoff: retry `n` waits `n * base_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retry_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(retry_attempts: u32, base_delay: Duration) -> Self {
        Self {
            retry_attempts,
            base_delay,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.retry_attempts, Duration::from_millis(config.retry_delay_ms))
    }

    pub fn backoff(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(retry)
    }

    pub fn max_attempts(&self) -> u32 {
        self.retry_attempts.saturating_add(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[derive(Debug, Error)]
#[error("batch {batch_id} ({key}) failed after {attempts} attempts: {last_error}")]
pub struct ExhaustedRetryError {
    pub batch_id: Uuid,
    pub key: BatchKey,
    pub attempts: u32,
    #[source]
    pub last_error: StageError,
}

/// Drive a batch through the processor until it succeeds or the policy is
/// exhausted. Returns the number of attempts used.
pub async fn process_with_retry(
    processor: &BatchProcessor,
    batch: &Batch,
    policy: RetryPolicy,
    metrics: &PipelineMetrics,
) -> Result<u32, ExhaustedRetryError> {
    let mut progress = StageProgress::default();
    let mut attempt = 1;

    loop {
        let error = match processor.process(batch, &mut progress).await {
            Ok(()) => return Ok(attempt),
            Err(e) => e,
        };

        if attempt >= policy.max_attempts() {
            return Err(ExhaustedRetryError {
                batch_id: batch.batch_id,
                key: batch.key.clone(),
                attempts: attempt,
                last_error: error,
            });
        }

        let delay = policy.backoff(attempt);
        warn!(
            batch_id = %batch.batch_id,
            key = %batch.key,
            attempt,
            stage = error.stage(),
            error = %error,
            delay_ms = delay.as_millis() as u64,
            "Batch processing failed, retrying"
        );
        metrics.record_retry();
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
