//! Job orchestration: durable ledger, chunked execution, admission and
//! stall recovery.

pub mod ledger;
pub mod model;
pub mod processor;
pub mod queue;
pub mod reaper;

pub use ledger::{ChunkRecord, JobLedger};
pub use model::{
    categorize_resource_key, sync_resource_key, Checkpoint, Job, JobKind, JobOrigin, JobProgress,
    JobStatus,
};
pub use processor::{chunk_count, BatchProcessor, ExecutionOutcome, ProcessorSettings};
pub use queue::{JobQueue, QueueSettings, QueueStatus};
pub use reaper::{ReapReport, StallReaper};
