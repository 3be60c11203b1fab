//! SQLite persistence for the job ledger, feeds, products and webhooks.
//!
//! One connection behind a mutex. Every repository module takes a
//! `&Database` and runs its statements inside [`Database::with_conn`].

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

pub mod error;
pub mod feed_repo;
pub mod job_repo;
pub mod migrations;
pub mod product_repo;
pub mod snapshot_repo;
pub mod webhook_repo;

pub use error::DatabaseError;

const FILE_PRAGMAS: &str =
    "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;";
const MEMORY_PRAGMAS: &str = "PRAGMA foreign_keys=ON;";

/// Shared handle to the feedsync store.
///
/// Clones share the same connection. The ledger's compare-and-set
/// updates rely on statements never interleaving, which the mutex gives us.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens the store file, creating parent directories as needed, and
    /// brings the schema up to date.
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| DatabaseError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let db = Self::prepare(Connection::open(path)?, FILE_PRAGMAS)?;
        log::info!("Store ready at {}", path.display());
        Ok(db)
    }

    /// A private store that lives as long as the handle. Used by tests and
    /// one-shot commands.
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        Self::prepare(Connection::open_in_memory()?, MEMORY_PRAGMAS)
    }

    fn prepare(conn: Connection, pragmas: &str) -> Result<Self, DatabaseError> {
        conn.execute_batch(pragmas)?;
        migrations::run_all(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` while holding the connection lock.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        let guard = self.conn.lock().map_err(|_| DatabaseError::LockPoisoned)?;
        f(&guard)
    }
}

/// `~/.feedsync/data/feedsync.db`, or `None` without a home directory.
pub fn default_database_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".feedsync").join("data").join("feedsync.db"))
}

/// Fixed-width UTC with millisecond precision, so `ORDER BY` and `<`
/// comparisons on the text column are chronological.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Inverse of [`format_timestamp`]. Garbage yields `None`.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub(crate) fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema_version(db: &Database) -> u32 {
        db.with_conn(|conn| {
            Ok(conn.query_row("SELECT MAX(version) FROM _migrations", [], |r| r.get(0))?)
        })
        .unwrap()
    }

    #[test]
    fn test_in_memory_store_is_migrated() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(schema_version(&db), migrations::latest_version());
    }

    #[test]
    fn test_file_store_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("feedsync.db");
        let db = Database::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(schema_version(&db), migrations::latest_version());

        // Reopening keeps the schema where it is.
        drop(db);
        let again = Database::open(&path).unwrap();
        assert_eq!(schema_version(&again), migrations::latest_version());
    }

    #[test]
    fn test_default_path_lives_under_home() {
        if let Some(path) = default_database_path() {
            assert!(path.ends_with(".feedsync/data/feedsync.db"));
        }
    }

    #[test]
    fn test_timestamps_sort_lexically() {
        let a = Utc::now();
        let b = a + chrono::Duration::milliseconds(1500);
        let (fa, fb) = (format_timestamp(a), format_timestamp(b));
        assert_eq!(fa.len(), fb.len());
        assert!(fa < fb);
        assert_eq!(
            parse_timestamp(&fa).unwrap().timestamp_millis(),
            a.timestamp_millis()
        );
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_clones_share_one_connection() {
        let db = Database::open_in_memory().unwrap();
        let other = db.clone();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO jobs (id, kind, resource_key, created_at)
                 VALUES ('t1', 'sync', 'feed:1', '2026-01-01T00:00:00.000Z')",
                [],
            )?;
            Ok(())
        })
        .unwrap();
        let count: u32 = other
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM jobs", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 1);
    }
}
