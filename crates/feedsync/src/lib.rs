pub mod app;
pub mod categorizer;
pub mod config;
pub mod db;
pub mod error;
pub mod feed;
pub mod jobs;
pub mod logging;
pub mod notify;
pub mod retry;
pub mod sanitize;
pub mod scheduler;
pub mod secrets;
pub mod taxonomy;

pub use app::Services;
pub use categorizer::{AiBatchCategorizer, CategoryMatcher, ClassificationMode, Classifier};
pub use config::{load_config, Config};
pub use error::{
    ConfigError, FeedsyncError, FetchError, JobError, OracleError, ParseError, QueueError,
    Result, StoreError, TaxonomyError,
};
pub use jobs::{
    BatchProcessor, ExecutionOutcome, Job, JobKind, JobLedger, JobQueue, JobStatus, StallReaper,
};
pub use scheduler::{ScheduleTrigger, Scheduler};
pub use secrets::{SecretError, SecretSource};
pub use taxonomy::{CategoryIndex, TaxonomyEntry};
