//! Work-set snapshots: the parsed items a resumable job iterates over.

use rusqlite::{params, OptionalExtension};

use super::{Database, DatabaseError};

#[derive(Debug, Clone)]
pub struct SnapshotRow {
    pub job_id: String,
    pub payload: String,
    pub item_count: i64,
    pub stored_at: String,
    pub expires_at: String,
}

/// Stores (or replaces) the snapshot of a job.
pub fn store(db: &Database, snapshot: &SnapshotRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO job_snapshots (job_id, payload, item_count, stored_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(job_id) DO UPDATE SET payload = excluded.payload,
                 item_count = excluded.item_count, stored_at = excluded.stored_at,
                 expires_at = excluded.expires_at",
            params![
                snapshot.job_id,
                snapshot.payload,
                snapshot.item_count,
                snapshot.stored_at,
                snapshot.expires_at,
            ],
        )?;
        Ok(())
    })
}

pub fn load(db: &Database, job_id: &str) -> Result<Option<SnapshotRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT job_id, payload, item_count, stored_at, expires_at
                 FROM job_snapshots WHERE job_id = ?1",
                params![job_id],
                |r| {
                    Ok(SnapshotRow {
                        job_id: r.get(0)?,
                        payload: r.get(1)?,
                        item_count: r.get(2)?,
                        stored_at: r.get(3)?,
                        expires_at: r.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    })
}

pub fn exists(db: &Database, job_id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM job_snapshots WHERE job_id = ?1)",
            params![job_id],
            |r| r.get(0),
        )?;
        Ok(exists)
    })
}

pub fn delete(db: &Database, job_id: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "DELETE FROM job_snapshots WHERE job_id = ?1",
            params![job_id],
        )?;
        Ok(())
    })
}

/// Deletes expired snapshots. Snapshots of jobs that are still pending or
/// running are kept regardless of age.
pub fn purge_expired(db: &Database, now: &str) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let deleted = conn.execute(
            "DELETE FROM job_snapshots
             WHERE expires_at < ?1
               AND job_id IN (SELECT id FROM jobs WHERE status IN ('completed', 'failed'))",
            params![now],
        )?;
        Ok(deleted)
    })
}
