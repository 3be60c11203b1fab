//! Schema versioning.
//!
//! Each step is an embedded SQL file applied once, inside its own
//! transaction, and recorded in `_migrations`.

use rusqlite::{params, Connection};

use super::error::DatabaseError;

struct Step {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const STEPS: &[Step] = &[
    Step {
        version: 1,
        name: "jobs",
        sql: include_str!("sql/001_create_jobs.sql"),
    },
    Step {
        version: 2,
        name: "job_snapshots",
        sql: include_str!("sql/002_create_job_snapshots.sql"),
    },
    Step {
        version: 3,
        name: "feeds",
        sql: include_str!("sql/003_create_feeds.sql"),
    },
    Step {
        version: 4,
        name: "products",
        sql: include_str!("sql/004_create_products.sql"),
    },
    Step {
        version: 5,
        name: "webhooks",
        sql: include_str!("sql/005_create_webhooks.sql"),
    },
];

const BOOKKEEPING: &str = "CREATE TABLE IF NOT EXISTS _migrations (
    version INTEGER PRIMARY KEY,
    description TEXT NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);";

/// Applies every step newer than the recorded schema version.
pub fn run_all(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(BOOKKEEPING)?;

    let applied: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |row| row.get(0),
    )?;

    for step in STEPS.iter().filter(|s| s.version > applied) {
        log::info!("Applying schema v{} ({})", step.version, step.name);
        apply(conn, step).map_err(|e| DatabaseError::Migration {
            version: step.version,
            reason: e.to_string(),
        })?;
    }

    Ok(())
}

fn apply(conn: &Connection, step: &Step) -> rusqlite::Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(step.sql)?;
    tx.execute(
        "INSERT INTO _migrations (version, description) VALUES (?1, ?2)",
        params![step.version, step.name],
    )?;
    tx.commit()
}

/// Highest schema version this build knows about.
pub fn latest_version() -> u32 {
    STEPS.last().map_or(0, |s| s.version)
}
