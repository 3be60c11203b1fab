use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::categorizer::{BatchSettings, ClassificationMode, DEFAULT_STOPLIST};
use crate::jobs::{ProcessorSettings, QueueSettings};
use crate::retry::RetryPolicy;
use crate::scheduler::TriggerIntervals;
use crate::secrets::SecretSource;

/// Top-level configuration. Every field has a default, so `{}` is a
/// complete configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub batch: BatchConfig,
    pub categorizer: CategorizerConfig,
    pub oracle: OracleConfig,
    pub reaper: ReaperConfig,
    pub scheduler: SchedulerConfig,
    pub taxonomy: TaxonomyConfig,
    pub webhooks: WebhookConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseConfig {
    /// Defaults to `~/.feedsync/data/feedsync.db`.
    pub path: Option<PathBuf>,
}

impl DatabaseConfig {
    pub fn resolved_path(&self) -> Option<PathBuf> {
        match &self.path {
            Some(path) => Some(crate::secrets::expand_home(&path.to_string_lossy())),
            None => crate::db::default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    #[serde(default = "default_pending_scan_limit")]
    pub pending_scan_limit: u64,
    #[serde(default = "default_readmit_delay_ms")]
    pub readmit_delay_ms: u64,
}

fn default_max_concurrent_jobs() -> usize {
    5
}

fn default_pending_scan_limit() -> u64 {
    50
}

fn default_readmit_delay_ms() -> u64 {
    1000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            pending_scan_limit: default_pending_scan_limit(),
            readmit_delay_ms: default_readmit_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchConfig {
    #[serde(default = "default_sync_chunk_size")]
    pub sync_chunk_size: usize,
    #[serde(default = "default_categorize_chunk_size")]
    pub categorize_chunk_size: usize,
    #[serde(default = "default_chunk_delay_ms")]
    pub chunk_delay_ms: u64,
    #[serde(default)]
    pub max_chunks_per_run: Option<u32>,
    #[serde(default = "default_snapshot_ttl_hours")]
    pub snapshot_ttl_hours: u32,
}

fn default_sync_chunk_size() -> usize {
    50
}

fn default_categorize_chunk_size() -> usize {
    20
}

fn default_chunk_delay_ms() -> u64 {
    500
}

fn default_snapshot_ttl_hours() -> u32 {
    24
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            sync_chunk_size: default_sync_chunk_size(),
            categorize_chunk_size: default_categorize_chunk_size(),
            chunk_delay_ms: default_chunk_delay_ms(),
            max_chunks_per_run: None,
            snapshot_ttl_hours: default_snapshot_ttl_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategorizerConfig {
    #[serde(default)]
    pub mode: ClassificationMode,
    /// Umbrella category names ignored by the matcher.
    #[serde(default = "default_stoplist")]
    pub stoplist: Vec<String>,
    #[serde(default = "default_oracle_batch_size")]
    pub oracle_batch_size: usize,
    #[serde(default = "default_rate_limit_delay_ms")]
    pub rate_limit_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default)]
    pub max_prompt_candidates: Option<usize>,
    /// Products selected by one categorize job.
    #[serde(default = "default_unprocessed_limit")]
    pub unprocessed_limit: u64,
}

fn default_stoplist() -> Vec<String> {
    DEFAULT_STOPLIST.iter().map(|s| s.to_string()).collect()
}

fn default_oracle_batch_size() -> usize {
    20
}

fn default_rate_limit_delay_ms() -> u64 {
    10_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_min_confidence() -> f64 {
    0.3
}

fn default_unprocessed_limit() -> u64 {
    100
}

impl Default for CategorizerConfig {
    fn default() -> Self {
        Self {
            mode: ClassificationMode::default(),
            stoplist: default_stoplist(),
            oracle_batch_size: default_oracle_batch_size(),
            rate_limit_delay_ms: default_rate_limit_delay_ms(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            min_confidence: default_min_confidence(),
            max_prompt_candidates: None,
            unprocessed_limit: default_unprocessed_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OracleConfig {
    #[serde(default = "default_oracle_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_oracle_model")]
    pub model: String,
    #[serde(default = "default_oracle_api_key")]
    pub api_key: SecretSource,
    #[serde(default = "default_oracle_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_oracle_endpoint() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

fn default_oracle_model() -> String {
    "gemini-1.5-flash".to_string()
}

fn default_oracle_api_key() -> SecretSource {
    SecretSource::from_env_var("FEEDSYNC_ORACLE_API_KEY")
}

fn default_oracle_timeout_secs() -> u64 {
    60
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            endpoint: default_oracle_endpoint(),
            model: default_oracle_model(),
            api_key: default_oracle_api_key(),
            timeout_secs: default_oracle_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReaperConfig {
    #[serde(default = "default_max_age_minutes")]
    pub max_age_minutes: i64,
}

fn default_max_age_minutes() -> i64 {
    15
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            max_age_minutes: default_max_age_minutes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfig {
    #[serde(default = "default_queue_secs")]
    pub queue_secs: u64,
    #[serde(default = "default_feeds_secs")]
    pub feeds_secs: u64,
    #[serde(default = "default_categorize_secs")]
    pub categorize_secs: u64,
    #[serde(default = "default_reaper_secs")]
    pub reaper_secs: u64,
}

fn default_queue_secs() -> u64 {
    120
}

fn default_feeds_secs() -> u64 {
    300
}

fn default_categorize_secs() -> u64 {
    300
}

fn default_reaper_secs() -> u64 {
    600
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_secs: default_queue_secs(),
            feeds_secs: default_feeds_secs(),
            categorize_secs: default_categorize_secs(),
            reaper_secs: default_reaper_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaxonomyConfig {
    /// Taxonomy JSON (array of entries).
    pub path: Option<PathBuf>,
    /// Prebuilt index written by `feedsync build-index`; preferred when present.
    pub index_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_webhook_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_webhook_timeout_secs() -> u64 {
    10
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: default_webhook_timeout_secs(),
        }
    }
}

impl Config {
    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            max_concurrent_jobs: self.queue.max_concurrent_jobs,
            pending_scan_limit: self.queue.pending_scan_limit,
            readmit_delay: Duration::from_millis(self.queue.readmit_delay_ms),
        }
    }

    pub fn processor_settings(&self) -> ProcessorSettings {
        ProcessorSettings {
            sync_chunk_size: self.batch.sync_chunk_size,
            categorize_chunk_size: self.batch.categorize_chunk_size,
            chunk_delay: Duration::from_millis(self.batch.chunk_delay_ms),
            max_chunks_per_run: self.batch.max_chunks_per_run,
            snapshot_ttl: chrono::Duration::hours(i64::from(self.batch.snapshot_ttl_hours)),
            unprocessed_limit: self.categorizer.unprocessed_limit,
        }
    }

    pub fn batch_settings(&self) -> BatchSettings {
        let c = &self.categorizer;
        BatchSettings {
            batch_size: c.oracle_batch_size,
            rate_limit_delay: Duration::from_millis(c.rate_limit_delay_ms),
            retry: RetryPolicy::new(c.max_attempts, Duration::from_millis(c.backoff_base_ms)),
            min_confidence: c.min_confidence,
            max_prompt_candidates: c.max_prompt_candidates,
        }
    }

    pub fn trigger_intervals(&self) -> TriggerIntervals {
        let s = &self.scheduler;
        TriggerIntervals {
            queue: Duration::from_secs(s.queue_secs),
            feeds: Duration::from_secs(s.feeds_secs),
            categorize: Duration::from_secs(s.categorize_secs),
            reaper: Duration::from_secs(s.reaper_secs),
        }
    }
}
