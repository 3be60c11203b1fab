//! Checkpointed chunk execution of sync and categorize jobs.
//!
//! A job's work set is captured once (fetched feed products, or the
//! unclassified products at start time), stored as a snapshot, and then
//! walked in fixed-size chunks. After every chunk the ledger checkpoint
//! advances by exactly one; a resumed job continues from the stored
//! offset against the same snapshot, so no chunk is processed twice and
//! none is skipped.

use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use super::ledger::{ChunkRecord, JobLedger};
use super::model::{Checkpoint, Job, JobKind, JobProgress, JobStatus};
use crate::categorizer::Classifier;
use crate::db::{feed_repo, format_timestamp};
use crate::error::{FetchError, JobError, StoreError};
use crate::feed::{FeedFetcher, Product, ProductStore, StoredProduct};
use crate::notify::{
    WebhookEvent, WebhookNotifier, EVENT_CATEGORIZATION_COMPLETED, EVENT_SYNC_COMPLETED,
};
use crate::sanitize::redact_url;

#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub sync_chunk_size: usize,
    pub categorize_chunk_size: usize,
    /// Pause between two chunks of the same job.
    pub chunk_delay: Duration,
    /// Chunks one execution may run before yielding; `None` runs to the end.
    pub max_chunks_per_run: Option<u32>,
    pub snapshot_ttl: chrono::Duration,
    /// Upper bound on products selected by one categorize job.
    pub unprocessed_limit: u64,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            sync_chunk_size: 50,
            categorize_chunk_size: 20,
            chunk_delay: Duration::from_millis(500),
            max_chunks_per_run: None,
            snapshot_ttl: chrono::Duration::hours(24),
            unprocessed_limit: 100,
        }
    }
}

/// How one execution of a job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Completed(JobProgress),
    /// The chunk budget ran out; the job stays `running` at this checkpoint.
    Yielded(Checkpoint),
    /// The job was moved out of `running` by someone else.
    Halted,
    /// The job was failed with this error.
    Failed(String),
}

/// Snapshot payload: the items a job iterates over.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
enum WorkSet {
    Sync {
        feed_id: String,
        products: Vec<Product>,
    },
    Categorize {
        products: Vec<StoredProduct>,
    },
}

impl WorkSet {
    fn len(&self) -> usize {
        match self {
            WorkSet::Sync { products, .. } => products.len(),
            WorkSet::Categorize { products } => products.len(),
        }
    }
}

/// Number of chunks needed for `len` items.
pub fn chunk_count(len: usize, chunk_size: usize) -> u32 {
    len.div_ceil(chunk_size.max(1)) as u32
}

/// End offset of the next chunk.
///
/// Normally `offset + chunk_size`. If the chunk size changed since the
/// plan was recorded, chunks grow so the remaining items still fit in the
/// remaining chunk count.
fn chunk_end(offset: usize, len: usize, chunk_size: usize, remaining_chunks: u32) -> usize {
    let remaining_items = len.saturating_sub(offset);
    let even = remaining_items.div_ceil(remaining_chunks.max(1) as usize);
    (offset + chunk_size.max(1).max(even)).min(len)
}

pub struct BatchProcessor {
    ledger: JobLedger,
    fetcher: Arc<dyn FeedFetcher>,
    store: Arc<dyn ProductStore>,
    classifier: Arc<Classifier>,
    notifier: Arc<dyn WebhookNotifier>,
    settings: ProcessorSettings,
}

impl BatchProcessor {
    pub fn new(
        ledger: JobLedger,
        fetcher: Arc<dyn FeedFetcher>,
        store: Arc<dyn ProductStore>,
        classifier: Arc<Classifier>,
        notifier: Arc<dyn WebhookNotifier>,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            ledger,
            fetcher,
            store,
            classifier,
            notifier,
            settings,
        }
    }

    pub fn ledger(&self) -> &JobLedger {
        &self.ledger
    }

    pub fn settings(&self) -> &ProcessorSettings {
        &self.settings
    }

    fn chunk_size(&self, kind: JobKind) -> usize {
        match kind {
            JobKind::Sync => self.settings.sync_chunk_size,
            JobKind::Categorize => self.settings.categorize_chunk_size,
        }
        .max(1)
    }

    /// Runs a started job. Jobs that already carry a checkpoint continue
    /// from it.
    pub async fn execute(&self, job: &Job) -> ExecutionOutcome {
        let span = info_span!(
            "job",
            job_id = %job.id,
            kind = job.kind.as_str(),
            resource = %job.resource_key
        );
        let result = self.run(job).instrument(span).await;
        self.settle(job, result)
    }

    /// Continues a running job from its checkpoint.
    pub async fn resume(&self, job: &Job) -> ExecutionOutcome {
        let span = info_span!("job_resume", job_id = %job.id, kind = job.kind.as_str());
        let result = self.run_resume(job).instrument(span).await;
        self.settle(job, result)
    }

    /// Resumes a job found stalled. Failures are recorded as a failed
    /// stall recovery.
    pub async fn recover(&self, job: &Job) -> ExecutionOutcome {
        let span = info_span!("job_recover", job_id = %job.id, kind = job.kind.as_str());
        let result = self
            .run_resume(job)
            .instrument(span)
            .await
            .map_err(|e| match e {
                JobError::Cancelled { .. } | JobError::StallResumeFailed(_) => e,
                other => JobError::StallResumeFailed(Box::new(other)),
            });
        self.settle(job, result)
    }

    /// Checks that `job` can be resumed right now: still running with a
    /// recorded plan, and its snapshot present while chunks remain.
    pub fn preflight(&self, job: &Job) -> Result<Checkpoint, JobError> {
        let current = self.ledger.require(&job.id)?;
        if current.status != JobStatus::Running {
            return Err(JobError::Cancelled {
                job_id: job.id.clone(),
            });
        }
        let checkpoint = current.checkpoint.ok_or_else(|| JobError::NoCheckpoint {
            job_id: job.id.clone(),
        })?;
        if !checkpoint.is_finished() && !self.ledger.has_snapshot(&job.id)? {
            return Err(JobError::SnapshotMissing(job.id.clone()));
        }
        Ok(checkpoint)
    }

    fn settle(&self, job: &Job, result: Result<ExecutionOutcome, JobError>) -> ExecutionOutcome {
        match result {
            Ok(outcome) => outcome,
            Err(JobError::Cancelled { .. }) => {
                log::info!("Job {} halted: no longer running", job.id);
                ExecutionOutcome::Halted
            }
            Err(e) => {
                let message = e.to_string();
                match self.ledger.fail(&job.id, &message) {
                    Ok(true) => {}
                    Ok(false) => log::debug!("Job {} was already terminal", job.id),
                    Err(db) => log::error!("Failed to record failure of job {}: {}", job.id, db),
                }
                ExecutionOutcome::Failed(message)
            }
        }
    }

    async fn run(&self, job: &Job) -> Result<ExecutionOutcome, JobError> {
        let current = self.ledger.require(&job.id)?;
        if current.status != JobStatus::Running {
            return Err(JobError::Cancelled {
                job_id: job.id.clone(),
            });
        }
        if current.checkpoint.is_some() {
            return self.run_resume(&current).await;
        }

        let work = self.prepare(&current).await?;
        let len = work.len();
        let total_chunks = chunk_count(len, self.chunk_size(current.kind));

        self.ledger
            .store_snapshot(&current.id, &work, len, self.settings.snapshot_ttl)?;
        if !self.ledger.set_plan(&current.id, len as u64, total_chunks)? {
            return Err(JobError::Cancelled {
                job_id: current.id.clone(),
            });
        }
        log::info!(
            "Job {}: {} items in {} chunks",
            current.id,
            len,
            total_chunks
        );

        self.run_chunks(&current, &work, Checkpoint::start(total_chunks))
            .await
    }

    async fn run_resume(&self, job: &Job) -> Result<ExecutionOutcome, JobError> {
        let checkpoint = self.preflight(job)?;
        if checkpoint.is_finished() {
            // Every chunk was checkpointed before the previous run died.
            log::info!("Job {} has all chunks checkpointed; completing", job.id);
            return self.finish(job).await;
        }
        let work: WorkSet = self
            .ledger
            .load_snapshot(&job.id)?
            .ok_or_else(|| JobError::SnapshotMissing(job.id.clone()))?;

        log::info!(
            "Resuming job {} at chunk {}/{} (offset {})",
            job.id,
            checkpoint.completed_chunks + 1,
            checkpoint.total_chunks,
            checkpoint.last_processed_offset
        );
        self.run_chunks(job, &work, checkpoint).await
    }

    /// Captures the work set of a fresh job.
    async fn prepare(&self, job: &Job) -> Result<WorkSet, JobError> {
        match job.kind {
            JobKind::Sync => {
                let feed_id = job.feed_id().unwrap_or_default().to_string();
                let feed = feed_repo::find_by_id(self.ledger.database(), &feed_id)?
                    .ok_or_else(|| JobError::FeedNotFound(feed_id.clone()))?;
                if feed.url.trim().is_empty() {
                    return Err(FetchError::MissingUrl.into());
                }

                log::info!("Fetching feed {} from {}", feed.id, redact_url(&feed.url));
                let body = self
                    .fetcher
                    .fetch(&feed.url)
                    .instrument(info_span!("fetch"))
                    .await?;
                let products = self.fetcher.parse(&body)?;
                log::info!("Parsed {} products from feed {}", products.len(), feed.id);

                Ok(WorkSet::Sync { feed_id, products })
            }
            JobKind::Categorize => {
                let products = self
                    .store
                    .unclassified(job.feed_id(), self.settings.unprocessed_limit)
                    .await?;
                log::info!(
                    "Selected {} unclassified products for {}",
                    products.len(),
                    job.resource_key
                );
                Ok(WorkSet::Categorize { products })
            }
        }
    }

    async fn run_chunks(
        &self,
        job: &Job,
        work: &WorkSet,
        checkpoint: Checkpoint,
    ) -> Result<ExecutionOutcome, JobError> {
        let len = work.len();
        let size = self.chunk_size(job.kind);
        let total = checkpoint.total_chunks;
        let mut completed = checkpoint.completed_chunks;
        let mut offset = (checkpoint.last_processed_offset as usize).min(len);
        let mut ran = 0u32;

        while completed < total {
            if self
                .settings
                .max_chunks_per_run
                .is_some_and(|budget| ran >= budget)
            {
                log::info!(
                    "Job {} yielding after {} chunks ({}/{} done)",
                    job.id,
                    ran,
                    completed,
                    total
                );
                return Ok(ExecutionOutcome::Yielded(Checkpoint {
                    total_chunks: total,
                    completed_chunks: completed,
                    last_processed_offset: offset as u64,
                }));
            }
            if ran > 0 && !self.settings.chunk_delay.is_zero() {
                tokio::time::sleep(self.settings.chunk_delay).await;
            }

            // Cancellation is observed here, between chunks.
            if self.ledger.status(&job.id)? != JobStatus::Running {
                return Err(JobError::Cancelled {
                    job_id: job.id.clone(),
                });
            }

            let end = chunk_end(offset, len, size, total - completed);
            let span = info_span!("chunk", index = completed, start = offset, end = end);
            let (processed, failed) = self
                .process_chunk(work, offset..end)
                .instrument(span)
                .await?;

            match self
                .ledger
                .record_chunk(&job.id, completed, processed, failed, end as u64)?
            {
                ChunkRecord::Recorded => {}
                ChunkRecord::Halted => {
                    return Err(JobError::Cancelled {
                        job_id: job.id.clone(),
                    })
                }
                ChunkRecord::Superseded => {
                    log::info!("Job {} is continued by another execution; stopping", job.id);
                    return Ok(ExecutionOutcome::Halted);
                }
            }

            completed += 1;
            offset = end;
            ran += 1;
            log::debug!(
                "Job {} chunk {}/{}: {} processed, {} failed",
                job.id,
                completed,
                total,
                processed,
                failed
            );
        }

        self.finish(job).await
    }

    /// Runs one chunk. Item failures are counted; store outages abort.
    async fn process_chunk(&self, work: &WorkSet, range: Range<usize>) -> Result<(u64, u64), JobError> {
        let mut processed = 0u64;
        let mut failed = 0u64;

        let mut tally = |result: Result<(), StoreError>| -> Result<(), JobError> {
            match result {
                Ok(()) => processed += 1,
                Err(e) if e.is_chunk_level() => return Err(e.into()),
                Err(e) => {
                    log::warn!("{}", e);
                    failed += 1;
                }
            }
            Ok(())
        };

        match work {
            WorkSet::Sync { feed_id, products } => {
                for product in &products[range] {
                    if product.sku.is_empty() && product.id.is_empty() {
                        tally(Err(StoreError::Rejected {
                            id: product.title.clone(),
                            reason: "product has no identifier".to_string(),
                        }))?;
                        continue;
                    }
                    let result = self.store.upsert(feed_id, product).await.map(|_| ());
                    tally(result)?;
                }
            }
            WorkSet::Categorize { products } => {
                let slice = &products[range];
                let plain: Vec<Product> = slice.iter().map(|s| s.product.clone()).collect();
                let classifications = self.classifier.classify(&plain).await;

                for (stored, classification) in slice.iter().zip(&classifications) {
                    let result = self
                        .store
                        .set_classification(&stored.id, classification)
                        .await;
                    tally(result)?;
                }
            }
        }

        Ok((processed, failed))
    }

    async fn finish(&self, job: &Job) -> Result<ExecutionOutcome, JobError> {
        if !self.ledger.complete(&job.id)? {
            let current = self.ledger.require(&job.id)?;
            return match current.status {
                // Finished by another worker, which also notified.
                JobStatus::Completed => Ok(ExecutionOutcome::Completed(current.progress)),
                // Another execution re-planned the job and still owns it.
                JobStatus::Running => {
                    log::info!("Job {} is not ours to complete; stopping", job.id);
                    Ok(ExecutionOutcome::Halted)
                }
                _ => Err(JobError::Cancelled {
                    job_id: job.id.clone(),
                }),
            };
        }

        if let Err(e) = self.ledger.delete_snapshot(&job.id) {
            log::warn!("Failed to purge snapshot of job {}: {}", job.id, e);
        }

        let current = self.ledger.require(&job.id)?;
        log::info!(
            "Job {} completed: {} processed, {} failed of {}",
            current.id,
            current.progress.items_processed,
            current.progress.items_failed,
            current.progress.items_total
        );
        self.after_completion(&current).await;
        Ok(ExecutionOutcome::Completed(current.progress))
    }

    /// Feed bookkeeping and webhooks. Failures here are logged only; the
    /// job is already completed.
    async fn after_completion(&self, job: &Job) {
        let Some(feed_id) = job.feed_id() else {
            return;
        };
        let db = self.ledger.database();
        let feed = match feed_repo::find_by_id(db, feed_id) {
            Ok(Some(feed)) => feed,
            Ok(None) => {
                log::warn!("Feed {} vanished before job {} completed", feed_id, job.id);
                return;
            }
            Err(e) => {
                log::error!("Failed to load feed {}: {}", feed_id, e);
                return;
            }
        };

        let now = Utc::now();
        let event = match job.kind {
            JobKind::Sync => {
                if let Err(e) = feed_repo::set_last_sync(db, feed_id, &format_timestamp(now)) {
                    log::error!("Failed to record last sync of feed {}: {}", feed_id, e);
                }
                EVENT_SYNC_COMPLETED
            }
            JobKind::Categorize => EVENT_CATEGORIZATION_COMPLETED,
        };

        let payload = WebhookEvent {
            event: event.to_string(),
            feed_id: Some(feed_id.to_string()),
            job_id: job.id.clone(),
            timestamp: now,
            items_processed: job.progress.items_processed,
            items_failed: job.progress.items_failed,
        };
        self.notifier.notify(&feed.user_id, &payload).await;
    }
}
