//! Orchestration core: queue, workers, retry classification, buffered
//! durable output, checkpointing and resource-aware scaling.

pub mod checkpoint;
pub mod classifier;
pub mod job;
pub mod orchestrator;
pub mod queue;
pub mod result_buffer;
pub mod scheduler;
pub mod stats;
pub mod worker;

pub use checkpoint::{CheckpointManager, CheckpointRecord};
pub use classifier::{Classification, RetryClassifier};
pub use job::{FailureKind, Job, JobId, JobOutcome, PoiRecord};
pub use orchestrator::{BatchSummary, Orchestrator};
pub use queue::{Lane, TaskQueue};
pub use result_buffer::{FlushPolicy, ResultBuffer};
pub use scheduler::{ResourceScheduler, SchedulerConfig};
pub use stats::{RunStats, StatsSnapshot, WorkerStats};
pub use worker::{TerminalEvent, WorkerContext, run_worker};
