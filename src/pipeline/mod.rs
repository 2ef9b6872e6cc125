pub mod broadcast;
pub mod metrics;
pub mod processor;
pub mod queue;
pub mod retry;
pub mod runner;
pub mod triggers;
pub mod worker;

pub use broadcast::BroadcastDispatcher;
pub use metrics::{MetricsSnapshot, PipelineMetrics, ProcessingMetrics};
pub use processor::{BatchProcessor, ProcessorSettings, StageError, StageProgress};
pub use queue::{ProcessingQueue, QueueRouter};
pub use retry::{process_with_retry, ExhaustedRetryError, RetryPolicy};
pub use runner::{LocationPipeline, PipelineBackends, PipelineError};
pub use triggers::{BatchTrigger, DemandDensityTrigger, GeofenceTrigger, TriggerError, TriggerSet};
