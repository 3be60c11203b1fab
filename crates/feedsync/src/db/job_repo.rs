//! Job repository: the `jobs` table.
//!
//! Every status transition is a conditional UPDATE so that two workers
//! racing on the same row cannot both win. Functions return `true` when
//! the transition was applied.

use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DatabaseError};

/// A raw job row from the database.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: String,
    pub kind: String,
    pub resource_key: String,
    pub origin: String,
    pub status: String,
    pub items_total: i64,
    pub items_processed: i64,
    pub items_failed: i64,
    pub total_chunks: Option<i64>,
    pub completed_chunks: Option<i64>,
    pub last_processed_offset: Option<i64>,
    pub error: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub progress_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            kind: row.get("kind")?,
            resource_key: row.get("resource_key")?,
            origin: row.get("origin")?,
            status: row.get("status")?,
            items_total: row.get("items_total")?,
            items_processed: row.get("items_processed")?,
            items_failed: row.get("items_failed")?,
            total_chunks: row.get("total_chunks")?,
            completed_chunks: row.get("completed_chunks")?,
            last_processed_offset: row.get("last_processed_offset")?,
            error: row.get("error")?,
            created_at: row.get("created_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            progress_at: row.get("progress_at")?,
        })
    }
}

/// Inserts a new pending job unless a job for the same resource is running.
///
/// The check and the insert are a single statement, so a concurrent
/// admission cannot slip in between them.
pub fn insert_pending(db: &Database, job: &JobRow) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let inserted = conn.execute(
            "INSERT INTO jobs (id, kind, resource_key, origin, status, created_at)
             SELECT ?1, ?2, ?3, ?4, 'pending', ?5
             WHERE NOT EXISTS (
                 SELECT 1 FROM jobs WHERE resource_key = ?3 AND status = 'running'
             )",
            params![job.id, job.kind, job.resource_key, job.origin, job.created_at],
        )?;
        Ok(inserted == 1)
    })
}

/// Finds a job by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM jobs WHERE id = ?1",
                params![id],
                JobRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Counts jobs with the given status.
pub fn count_by_status(db: &Database, status: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = ?1",
            params![status],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

/// Lists jobs with the given status, oldest first.
pub fn list_by_status(
    db: &Database,
    status: &str,
    limit: u64,
) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM jobs WHERE status = ?1
             ORDER BY created_at ASC, rowid ASC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![status, limit as i64], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Lists the most recently created jobs, newest first.
pub fn list_recent(db: &Database, limit: u64) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM jobs ORDER BY created_at DESC, rowid DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Whether a pending or running job exists for the resource.
pub fn has_active(db: &Database, resource_key: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM jobs
             WHERE resource_key = ?1 AND status IN ('pending', 'running'))",
            params![resource_key],
            |r| r.get(0),
        )?;
        Ok(exists)
    })
}

/// Whether a running job exists for the resource.
pub fn has_running(db: &Database, resource_key: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM jobs WHERE resource_key = ?1 AND status = 'running')",
            params![resource_key],
            |r| r.get(0),
        )?;
        Ok(exists)
    })
}

/// `pending -> running`, only if no other job holds the resource and
/// fewer than `max_running` jobs are running overall.
pub fn try_start(
    db: &Database,
    id: &str,
    now: &str,
    max_running: u64,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let updated = conn.execute(
            "UPDATE jobs SET status = 'running', started_at = ?2, progress_at = ?2
             WHERE id = ?1 AND status = 'pending'
               AND NOT EXISTS (
                   SELECT 1 FROM jobs AS other
                   WHERE other.resource_key = jobs.resource_key
                     AND other.status = 'running'
               )
               AND (SELECT COUNT(*) FROM jobs AS other WHERE other.status = 'running') < ?3",
            params![id, now, i64::try_from(max_running).unwrap_or(i64::MAX)],
        )?;
        Ok(updated == 1)
    })
}

/// Records the work plan of a freshly started job.
pub fn set_plan(
    db: &Database,
    id: &str,
    items_total: i64,
    total_chunks: i64,
    now: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let updated = conn.execute(
            "UPDATE jobs SET items_total = ?2, total_chunks = ?3, completed_chunks = 0,
                 last_processed_offset = 0, items_processed = 0, items_failed = 0,
                 progress_at = ?4
             WHERE id = ?1 AND status = 'running'",
            params![id, items_total, total_chunks, now],
        )?;
        Ok(updated == 1)
    })
}

/// Advances the checkpoint by one chunk.
///
/// Applied only while the job is running and its checkpoint still reads
/// `expected_completed`, so a stale writer cannot double-count a chunk.
#[allow(clippy::too_many_arguments)]
pub fn record_chunk(
    db: &Database,
    id: &str,
    expected_completed: i64,
    processed: i64,
    failed: i64,
    offset: i64,
    now: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let updated = conn.execute(
            "UPDATE jobs SET completed_chunks = completed_chunks + 1,
                 items_processed = items_processed + ?3,
                 items_failed = items_failed + ?4,
                 last_processed_offset = ?5,
                 progress_at = ?6
             WHERE id = ?1 AND status = 'running' AND completed_chunks = ?2",
            params![id, expected_completed, processed, failed, offset, now],
        )?;
        Ok(updated == 1)
    })
}

/// `running -> completed`, only once every chunk is checkpointed.
pub fn complete(db: &Database, id: &str, now: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let updated = conn.execute(
            "UPDATE jobs SET status = 'completed', completed_at = ?2, progress_at = ?2
             WHERE id = ?1 AND status = 'running'
               AND completed_chunks IS NOT NULL AND completed_chunks = total_chunks",
            params![id, now],
        )?;
        Ok(updated == 1)
    })
}

/// Moves a non-terminal job to `failed` with the given error.
pub fn fail(db: &Database, id: &str, error: &str, now: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let updated = conn.execute(
            "UPDATE jobs SET status = 'failed', error = ?2, completed_at = ?3
             WHERE id = ?1 AND status IN ('pending', 'running')",
            params![id, error, now],
        )?;
        Ok(updated == 1)
    })
}

/// Refreshes `progress_at` on a running job.
pub fn touch_progress(db: &Database, id: &str, now: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let updated = conn.execute(
            "UPDATE jobs SET progress_at = ?2 WHERE id = ?1 AND status = 'running'",
            params![id, now],
        )?;
        Ok(updated == 1)
    })
}

/// Running jobs started before `cutoff` with no checkpoint progress since.
pub fn find_stalled(db: &Database, cutoff: &str) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM jobs
             WHERE status = 'running'
               AND started_at < ?1
               AND COALESCE(progress_at, started_at) < ?1
             ORDER BY started_at ASC",
        )?;
        let rows = stmt
            .query_map(params![cutoff], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}
