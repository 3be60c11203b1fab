//! Durable job records and work-set snapshots.
//!
//! [`JobLedger`] is the single place job state changes. Each transition
//! maps onto one conditional statement in [`job_repo`], so concurrent
//! admission passes, workers and the stall reaper can race on the same
//! job without corrupting it: the loser simply sees `false`.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::model::{Job, JobKind, JobOrigin, JobStatus};
use crate::db::job_repo::{self, JobRow};
use crate::db::snapshot_repo::{self, SnapshotRow};
use crate::db::{format_timestamp, Database, DatabaseError};
use crate::error::{JobError, QueueError};

/// Result of trying to checkpoint one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkRecord {
    Recorded,
    /// The job left `running` (failed by an operator or the reaper).
    Halted,
    /// Another execution of the same job checkpointed this chunk first and
    /// owns the job from here on.
    Superseded,
}

#[derive(Clone)]
pub struct JobLedger {
    db: Database,
}

impl JobLedger {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn now() -> String {
        format_timestamp(Utc::now())
    }

    fn decode(rows: Vec<JobRow>) -> Vec<Job> {
        rows.into_iter()
            .filter_map(|row| match Job::try_from(row) {
                Ok(job) => Some(job),
                Err(e) => {
                    log::warn!("Skipping job record: {}", e);
                    None
                }
            })
            .collect()
    }

    // ─── Admission ──────────────────────────────────────────────────────

    /// Records a new pending job.
    ///
    /// Rejected with [`QueueError::AlreadyRunning`] while a job for the
    /// same resource is running.
    pub fn schedule(
        &self,
        kind: JobKind,
        resource_key: &str,
        origin: JobOrigin,
    ) -> Result<Job, QueueError> {
        let id = uuid::Uuid::new_v4().to_string();
        let created_at = Utc::now();
        let row = JobRow {
            id: id.clone(),
            kind: kind.as_str().to_string(),
            resource_key: resource_key.to_string(),
            origin: origin.as_str().to_string(),
            status: JobStatus::Pending.as_str().to_string(),
            items_total: 0,
            items_processed: 0,
            items_failed: 0,
            total_chunks: None,
            completed_chunks: None,
            last_processed_offset: None,
            error: None,
            created_at: format_timestamp(created_at),
            started_at: None,
            completed_at: None,
            progress_at: None,
        };

        if !job_repo::insert_pending(&self.db, &row)? {
            return Err(QueueError::AlreadyRunning {
                resource_key: resource_key.to_string(),
            });
        }

        log::info!(
            "Scheduled {} job {} for '{}' ({})",
            kind.as_str(),
            id,
            resource_key,
            origin.as_str()
        );

        Ok(Job {
            id,
            kind,
            resource_key: resource_key.to_string(),
            origin,
            status: JobStatus::Pending,
            progress: Default::default(),
            checkpoint: None,
            error: None,
            created_at,
            started_at: None,
            completed_at: None,
            progress_at: None,
        })
    }

    /// `pending -> running`. `false` when the job was already claimed, its
    /// resource is busy, or `max_running` jobs are already running.
    pub fn try_start(&self, job_id: &str, max_running: usize) -> Result<bool, DatabaseError> {
        job_repo::try_start(&self.db, job_id, &Self::now(), max_running as u64)
    }

    // ─── Queries ────────────────────────────────────────────────────────

    pub fn get(&self, job_id: &str) -> Result<Option<Job>, JobError> {
        job_repo::find_by_id(&self.db, job_id)?
            .map(Job::try_from)
            .transpose()
    }

    pub fn require(&self, job_id: &str) -> Result<Job, JobError> {
        self.get(job_id)?
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))
    }

    pub fn status(&self, job_id: &str) -> Result<JobStatus, JobError> {
        Ok(self.require(job_id)?.status)
    }

    pub fn count(&self, status: JobStatus) -> Result<u64, DatabaseError> {
        job_repo::count_by_status(&self.db, status.as_str())
    }

    /// Pending jobs, oldest first.
    pub fn pending(&self, limit: u64) -> Result<Vec<Job>, DatabaseError> {
        let rows = job_repo::list_by_status(&self.db, JobStatus::Pending.as_str(), limit)?;
        Ok(Self::decode(rows))
    }

    pub fn running(&self, limit: u64) -> Result<Vec<Job>, DatabaseError> {
        let rows = job_repo::list_by_status(&self.db, JobStatus::Running.as_str(), limit)?;
        Ok(Self::decode(rows))
    }

    pub fn recent(&self, limit: u64) -> Result<Vec<Job>, DatabaseError> {
        Ok(Self::decode(job_repo::list_recent(&self.db, limit)?))
    }

    /// Whether a pending or running job exists for the resource.
    pub fn has_active(&self, resource_key: &str) -> Result<bool, DatabaseError> {
        job_repo::has_active(&self.db, resource_key)
    }

    pub fn has_running(&self, resource_key: &str) -> Result<bool, DatabaseError> {
        job_repo::has_running(&self.db, resource_key)
    }

    /// Running jobs with no progress since `cutoff`.
    pub fn stalled(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, DatabaseError> {
        let rows = job_repo::find_stalled(&self.db, &format_timestamp(cutoff))?;
        Ok(Self::decode(rows))
    }

    // ─── Progress ───────────────────────────────────────────────────────

    /// Records the item count and chunk plan of a started job and resets
    /// its checkpoint.
    pub fn set_plan(&self, job_id: &str, items_total: u64, total_chunks: u32) -> Result<bool, DatabaseError> {
        job_repo::set_plan(
            &self.db,
            job_id,
            items_total as i64,
            i64::from(total_chunks),
            &Self::now(),
        )
    }

    /// Checkpoints one finished chunk.
    ///
    /// `expected_completed` is the chunk count the caller read before
    /// processing the chunk; a mismatch means another worker advanced the
    /// job, so the chunk is not counted again and the caller must stop.
    pub fn record_chunk(
        &self,
        job_id: &str,
        expected_completed: u32,
        processed: u64,
        failed: u64,
        offset: u64,
    ) -> Result<ChunkRecord, JobError> {
        if job_repo::record_chunk(
            &self.db,
            job_id,
            i64::from(expected_completed),
            processed as i64,
            failed as i64,
            offset as i64,
            &Self::now(),
        )? {
            return Ok(ChunkRecord::Recorded);
        }

        match self.status(job_id)? {
            JobStatus::Running => {
                log::warn!(
                    "Job {} was checkpointed past chunk {} by another execution",
                    job_id,
                    expected_completed
                );
                Ok(ChunkRecord::Superseded)
            }
            _ => Ok(ChunkRecord::Halted),
        }
    }

    /// `running -> completed`, only once every chunk is checkpointed.
    pub fn complete(&self, job_id: &str) -> Result<bool, DatabaseError> {
        job_repo::complete(&self.db, job_id, &Self::now())
    }

    /// Moves a pending or running job to `failed`.
    pub fn fail(&self, job_id: &str, error: &str) -> Result<bool, DatabaseError> {
        let failed = job_repo::fail(&self.db, job_id, error, &Self::now())?;
        if failed {
            log::warn!("Job {} failed: {}", job_id, error);
        }
        Ok(failed)
    }

    /// Operator cancellation. A running worker notices at its next chunk
    /// boundary.
    pub fn cancel(&self, job_id: &str) -> Result<bool, DatabaseError> {
        self.fail(job_id, "Cancelled by operator")
    }

    /// Marks a running job as alive without advancing its checkpoint.
    pub fn touch(&self, job_id: &str) -> Result<bool, DatabaseError> {
        job_repo::touch_progress(&self.db, job_id, &Self::now())
    }

    // ─── Snapshots ──────────────────────────────────────────────────────

    /// Persists the work set of a job so that it can be resumed without
    /// refetching its source.
    pub fn store_snapshot<T: Serialize>(
        &self,
        job_id: &str,
        work: &T,
        item_count: usize,
        ttl: chrono::Duration,
    ) -> Result<(), JobError> {
        let now = Utc::now();
        let row = SnapshotRow {
            job_id: job_id.to_string(),
            payload: serde_json::to_string(work)?,
            item_count: item_count as i64,
            stored_at: format_timestamp(now),
            expires_at: format_timestamp(now + ttl),
        };
        snapshot_repo::store(&self.db, &row)?;
        log::debug!("Stored snapshot of {} items for job {}", item_count, job_id);
        Ok(())
    }

    pub fn load_snapshot<T: DeserializeOwned>(&self, job_id: &str) -> Result<Option<T>, JobError> {
        match snapshot_repo::load(&self.db, job_id)? {
            Some(row) => Ok(Some(serde_json::from_str(&row.payload)?)),
            None => Ok(None),
        }
    }

    pub fn has_snapshot(&self, job_id: &str) -> Result<bool, DatabaseError> {
        snapshot_repo::exists(&self.db, job_id)
    }

    pub fn delete_snapshot(&self, job_id: &str) -> Result<(), DatabaseError> {
        snapshot_repo::delete(&self.db, job_id)
    }

    /// Drops expired snapshots of finished jobs.
    pub fn purge_expired_snapshots(&self) -> Result<usize, DatabaseError> {
        snapshot_repo::purge_expired(&self.db, &Self::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::{categorize_resource_key, Checkpoint};

    fn ledger() -> JobLedger {
        JobLedger::new(Database::open_in_memory().unwrap())
    }

    #[test]
    fn test_schedule_rejected_while_running() {
        let ledger = ledger();
        let job = ledger
            .schedule(JobKind::Sync, "feed-1", JobOrigin::Scheduled)
            .unwrap();
        assert!(ledger.try_start(&job.id, 5).unwrap());

        let err = ledger
            .schedule(JobKind::Sync, "feed-1", JobOrigin::Manual)
            .unwrap_err();
        assert!(matches!(err, QueueError::AlreadyRunning { ref resource_key } if resource_key == "feed-1"));

        // Different resource is fine.
        let key = categorize_resource_key(Some("feed-1"));
        assert!(ledger
            .schedule(JobKind::Categorize, &key, JobOrigin::Manual)
            .is_ok());
    }

    #[test]
    fn test_checkpoint_flow() {
        let ledger = ledger();
        let job = ledger
            .schedule(JobKind::Sync, "feed-1", JobOrigin::Scheduled)
            .unwrap();
        ledger.try_start(&job.id, 5).unwrap();
        ledger.set_plan(&job.id, 120, 3).unwrap();

        assert_eq!(
            ledger.record_chunk(&job.id, 0, 48, 2, 50).unwrap(),
            ChunkRecord::Recorded
        );
        // A second execution holding the same stale checkpoint loses.
        assert_eq!(
            ledger.record_chunk(&job.id, 0, 50, 0, 50).unwrap(),
            ChunkRecord::Superseded
        );

        let stored = ledger.require(&job.id).unwrap();
        assert_eq!(
            stored.checkpoint,
            Some(Checkpoint {
                total_chunks: 3,
                completed_chunks: 1,
                last_processed_offset: 50
            })
        );
        assert_eq!(stored.progress.items_processed, 48);
        assert_eq!(stored.progress.items_failed, 2);
        assert!(!ledger.complete(&job.id).unwrap());
    }

    #[test]
    fn test_cancel_halts_checkpointing() {
        let ledger = ledger();
        let job = ledger
            .schedule(JobKind::Sync, "feed-1", JobOrigin::Scheduled)
            .unwrap();
        ledger.try_start(&job.id, 5).unwrap();
        ledger.set_plan(&job.id, 10, 1).unwrap();

        assert!(ledger.cancel(&job.id).unwrap());
        assert_eq!(
            ledger.record_chunk(&job.id, 0, 10, 0, 10).unwrap(),
            ChunkRecord::Halted
        );
        let stored = ledger.require(&job.id).unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("Cancelled by operator"));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let ledger = ledger();
        let job = ledger
            .schedule(JobKind::Sync, "feed-1", JobOrigin::Scheduled)
            .unwrap();
        let items = vec!["a".to_string(), "b".to_string()];
        ledger
            .store_snapshot(&job.id, &items, items.len(), chrono::Duration::hours(24))
            .unwrap();

        assert!(ledger.has_snapshot(&job.id).unwrap());
        let loaded: Option<Vec<String>> = ledger.load_snapshot(&job.id).unwrap();
        assert_eq!(loaded, Some(items));

        ledger.delete_snapshot(&job.id).unwrap();
        let gone: Option<Vec<String>> = ledger.load_snapshot(&job.id).unwrap();
        assert!(gone.is_none());
    }

    #[test]
    fn test_require_missing_job() {
        assert!(matches!(
            ledger().require("nope"),
            Err(JobError::NotFound(_))
        ));
    }
}
