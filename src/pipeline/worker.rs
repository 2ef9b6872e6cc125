use crate::pipeline::metrics::PipelineMetrics;
use crate::pipeline::processor::BatchProcessor;
use crate::pipeline::queue::ProcessingQueue;
use crate::pipeline::retry::{process_with_retry, RetryPolicy};
use crate::pipeline::triggers::TriggerSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

/// Everything a worker needs besides its queue.
pub struct WorkerContext {
    pub processor: BatchProcessor,
    pub policy: RetryPolicy,
    pub triggers: TriggerSet,
    pub metrics: Arc<PipelineMetrics>,
}

/// Process batches from `queue` until it is closed and drained.
pub async fn run_worker(worker_id: usize, queue: Arc<ProcessingQueue>, ctx: Arc<WorkerContext>) {
    info!(worker_id, "Processing worker started");

    while let Some(mut batch) = queue.pop().await {
        let started = Instant::now();
        let size = batch.len();

        debug!(
            worker_id,
            batch_id = %batch.batch_id,
            key = %batch.key,
            size,
            "Processing batch"
        );

        match process_with_retry(&ctx.processor, &batch, ctx.policy, &ctx.metrics).await {
            Ok(attempts) => {
                let elapsed = started.elapsed();
                batch.metadata.processing_time_ms = Some(elapsed.as_millis() as u64);
                ctx.metrics.record_batch(size, elapsed, true);
                debug!(
                    batch_id = %batch.batch_id,
                    attempts,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Batch processed"
                );

                if !ctx.triggers.is_empty() {
                    // Triggers are supervised on their own tasks; nothing waits on them.
                    drop(ctx.triggers.spawn_all(Arc::new(batch)));
                }
            }
            Err(e) => {
                ctx.metrics.record_batch(size, started.elapsed(), false);
                let contents = serde_json::to_string(&batch).unwrap_or_default();
                error!(
                    batch_id = %e.batch_id,
                    key = %e.key,
                    region_id = %batch.region_id,
                    attempts = e.attempts,
                    error = %e.last_error,
                    batch = %contents,
                    "Dropping batch after exhausting retries"
                );
            }
        }
    }

    info!(worker_id, "Processing worker stopped");
}
