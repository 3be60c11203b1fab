//! Feed repository: the `feeds` table.

use rusqlite::{params, OptionalExtension, Row};

use super::{format_timestamp, now_timestamp, parse_timestamp, Database, DatabaseError};
use crate::feed::{Feed, FeedStatus};

fn from_row(row: &Row<'_>) -> Result<Feed, rusqlite::Error> {
    let last_sync_at: Option<String> = row.get("last_sync_at")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    let status: String = row.get("status")?;
    let interval: i64 = row.get("sync_interval_secs")?;
    let created = parse_timestamp(&created_at).unwrap_or_default();
    Ok(Feed {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        name: row.get("name")?,
        url: row.get("url")?,
        status: FeedStatus::parse(&status),
        is_paused: row.get("is_paused")?,
        sync_interval_secs: interval.max(0) as u64,
        last_sync_at: last_sync_at.as_deref().and_then(parse_timestamp),
        created_at: created,
        updated_at: parse_timestamp(&updated_at).unwrap_or(created),
    })
}

pub fn insert(db: &Database, feed: &Feed) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO feeds (id, user_id, name, url, status, is_paused, sync_interval_secs,
             last_sync_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                feed.id,
                feed.user_id,
                feed.name,
                feed.url,
                feed.status.as_str(),
                feed.is_paused,
                feed.sync_interval_secs as i64,
                feed.last_sync_at.map(format_timestamp),
                format_timestamp(feed.created_at),
                format_timestamp(feed.updated_at),
            ],
        )?;
        Ok(())
    })
}

pub fn find_by_id(db: &Database, id: &str) -> Result<Option<Feed>, DatabaseError> {
    db.with_conn(|conn| {
        let feed = conn
            .query_row("SELECT * FROM feeds WHERE id = ?1", params![id], from_row)
            .optional()?;
        Ok(feed)
    })
}

pub fn list_all(db: &Database) -> Result<Vec<Feed>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM feeds ORDER BY created_at ASC")?;
        let feeds = stmt
            .query_map([], from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(feeds)
    })
}

/// Active, unpaused feeds, candidates for periodic sync.
pub fn list_schedulable(db: &Database) -> Result<Vec<Feed>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM feeds WHERE status = 'active' AND is_paused = 0
             ORDER BY created_at ASC",
        )?;
        let feeds = stmt
            .query_map([], from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(feeds)
    })
}

pub fn set_last_sync(db: &Database, id: &str, at: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE feeds SET last_sync_at = ?2, updated_at = ?2 WHERE id = ?1",
            params![id, at],
        )?;
        Ok(())
    })
}

pub fn set_paused(db: &Database, id: &str, paused: bool) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let updated = conn.execute(
            "UPDATE feeds SET is_paused = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, paused, now_timestamp()],
        )?;
        Ok(updated == 1)
    })
}
