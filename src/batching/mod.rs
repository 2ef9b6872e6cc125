pub mod accumulator;
pub mod batch;
pub mod scheduler;

pub use accumulator::{AccumulatorSettings, AddOutcome, AddStatus, BatchAccumulator, IngestError};
pub use batch::{Absorbed, Batch, BatchMetadata, FlushReason, PendingBatch};
pub use scheduler::{FlushScheduler, FlushTimer, TimerClass};
