use crate::batching::Batch;
use crate::config::types::OverflowStrategy;
use crate::location::BatchKey;
use crate::pipeline::metrics::PipelineMetrics;
use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::error;

/// FIFO of sealed batches drained by exactly one worker.
pub struct ProcessingQueue {
    capacity: Option<usize>,
    strategy: OverflowStrategy,
    state: Mutex<QueueState>,
    notify: Notify,
}

struct QueueState {
    buffer: VecDeque<Batch>,
    closed: bool,
}

/// What happened to a pushed batch.
#[derive(Debug)]
pub enum PushOutcome {
    Enqueued,
    /// The queue was full; the oldest queued batch was evicted to make room
    DroppedOldest(Batch),
    /// The queue was full; the pushed batch was discarded
    DroppedNewest(Batch),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("processing queue is closed")]
    Closed(Box<Batch>),
}

impl ProcessingQueue {
    pub fn new(capacity: Option<usize>, strategy: OverflowStrategy) -> Self {
        Self {
            capacity,
            strategy,
            state: Mutex::new(QueueState {
                buffer: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(None, OverflowStrategy::WaitForever)
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Never blocks. A full queue applies the overflow strategy.
    pub fn push(&self, batch: Batch) -> Result<PushOutcome, QueueError> {
        let mut state = self.lock();
        if state.closed {
            return Err(QueueError::Closed(Box::new(batch)));
        }

        let full = self
            .capacity
            .map_or(false, |capacity| state.buffer.len() >= capacity);

        let outcome = if !full {
            state.buffer.push_back(batch);
            PushOutcome::Enqueued
        } else {
            match self.strategy {
                OverflowStrategy::WaitForever => {
                    state.buffer.push_back(batch);
                    PushOutcome::Enqueued
                }
                OverflowStrategy::DropOldest => {
                    let evicted = state.buffer.pop_front();
                    state.buffer.push_back(batch);
                    match evicted {
                        Some(evicted) => PushOutcome::DroppedOldest(evicted),
                        None => PushOutcome::Enqueued,
                    }
                }
                OverflowStrategy::DropNewest => PushOutcome::DroppedNewest(batch),
            }
        };
        drop(state);

        self.notify.notify_one();
        Ok(outcome)
    }

    /// Wait for the next batch. Returns `None` once closed and drained.
    pub async fn pop(&self) -> Option<Batch> {
        loop {
            {
                let mut state = self.lock();
                if let Some(batch) = state.buffer.pop_front() {
                    return Some(batch);
                }
                if state.closed {
                    return None;
                }
            }
            // Single consumer: a notify_one issued before we wait leaves a permit
            self.notify.notified().await;
        }
    }

    /// Reject further pushes; queued batches are still handed out.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Routes sealed batches to per-worker queues by key so one key is always
/// processed by the same worker, in seal order.
pub struct QueueRouter {
    queues: Vec<Arc<ProcessingQueue>>,
    metrics: Arc<PipelineMetrics>,
}

impl QueueRouter {
    pub fn new(
        workers: usize,
        capacity: Option<usize>,
        strategy: OverflowStrategy,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        let queues = (0..workers.max(1))
            .map(|_| Arc::new(ProcessingQueue::new(capacity, strategy)))
            .collect();
        Self { queues, metrics }
    }

    pub fn queues(&self) -> &[Arc<ProcessingQueue>] {
        &self.queues
    }

    pub fn index_for(&self, key: &BatchKey) -> usize {
        if self.queues.len() == 1 {
            return 0;
        }
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.queues.len() as u64) as usize
    }

    /// Enqueue a sealed batch. Evictions and rejections are data loss and
    /// are logged with the full batch.
    pub fn push(&self, batch: Batch) {
        let queue = &self.queues[self.index_for(&batch.key)];
        match queue.push(batch) {
            Ok(PushOutcome::Enqueued) => {}
            Ok(PushOutcome::DroppedOldest(dropped)) | Ok(PushOutcome::DroppedNewest(dropped)) => {
                self.metrics.record_dropped();
                log_dropped(&dropped, "processing queue full");
            }
            Err(QueueError::Closed(dropped)) => {
                self.metrics.record_dropped();
                log_dropped(&dropped, "processing queue closed");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn close(&self) {
        for queue in &self.queues {
            queue.close();
        }
    }
}

fn log_dropped(batch: &Batch, cause: &str) {
    let contents = serde_json::to_string(&batch.updates).unwrap_or_default();
    error!(
        batch_id = %batch.batch_id,
        key = %batch.key,
        size = batch.len(),
        updates = %contents,
        "Dropping sealed batch: {}",
        cause
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batching::{FlushReason, PendingBatch};
    use crate::location::update::sample_update;

    fn make_batch(key: &str, driver: &str) -> Batch {
        let mut pending = PendingBatch::new(BatchKey::new(key), "nyc".to_string());
        pending.absorb(sample_update(driver, 1));
        pending.seal(FlushReason::Timer)
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = ProcessingQueue::unbounded();
        queue.push(make_batch("k", "a")).unwrap();
        queue.push(make_batch("k", "b")).unwrap();
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.pop().await.unwrap().updates[0].driver_id, "a");
        assert_eq!(queue.pop().await.unwrap().updates[0].driver_id, "b");
    }

    #[tokio::test]
    async fn test_drop_oldest_strategy() {
        let queue = ProcessingQueue::new(Some(2), OverflowStrategy::DropOldest);
        queue.push(make_batch("k", "a")).unwrap();
        queue.push(make_batch("k", "b")).unwrap();

        let outcome = queue.push(make_batch("k", "c")).unwrap();
        assert!(matches!(outcome, PushOutcome::DroppedOldest(ref b) if b.updates[0].driver_id == "a"));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().await.unwrap().updates[0].driver_id, "b");
    }

    #[test]
    fn test_drop_newest_strategy() {
        let queue = ProcessingQueue::new(Some(1), OverflowStrategy::DropNewest);
        queue.push(make_batch("k", "a")).unwrap();

        let outcome = queue.push(make_batch("k", "b")).unwrap();
        assert!(matches!(outcome, PushOutcome::DroppedNewest(ref b) if b.updates[0].driver_id == "b"));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_wait_forever_ignores_capacity() {
        let queue = ProcessingQueue::new(Some(1), OverflowStrategy::WaitForever);
        for driver in ["a", "b", "c"] {
            assert!(matches!(queue.push(make_batch("k", driver)).unwrap(), PushOutcome::Enqueued));
        }
        assert_eq!(queue.len(), 3);
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = ProcessingQueue::unbounded();
        queue.push(make_batch("k", "a")).unwrap();
        queue.close();

        assert!(matches!(queue.push(make_batch("k", "b")), Err(QueueError::Closed(_))));
        assert!(queue.pop().await.is_some());
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = Arc::new(ProcessingQueue::unbounded());
        let consumer = Arc::clone(&queue);
        let handle = tokio::spawn(async move { consumer.pop().await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        queue.push(make_batch("k", "late")).unwrap();

        let batch = handle.await.unwrap().unwrap();
        assert_eq!(batch.updates[0].driver_id, "late");
    }

    #[test]
    fn test_router_keeps_a_key_on_one_queue() {
        let metrics = Arc::new(PipelineMetrics::new());
        let router = QueueRouter::new(4, None, OverflowStrategy::WaitForever, Arc::clone(&metrics));
        let key = BatchKey::new("nyc:dr5reg");
        let index = router.index_for(&key);
        for _ in 0..3 {
            router.push(make_batch("nyc:dr5reg", "a"));
        }
        assert_eq!(router.queues()[index].len(), 3);
        assert_eq!(router.len(), 3);
    }

    #[test]
    fn test_router_counts_drops() {
        let metrics = Arc::new(PipelineMetrics::new());
        let router = QueueRouter::new(1, Some(1), OverflowStrategy::DropNewest, Arc::clone(&metrics));
        router.push(make_batch("k", "a"));
        router.push(make_batch("k", "b"));
        assert_eq!(router.len(), 1);
        assert_eq!(metrics.dropped_batches(), 1);
    }
}
