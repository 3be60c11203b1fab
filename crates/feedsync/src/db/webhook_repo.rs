//! Webhook subscriptions: the `webhooks` table.

use rusqlite::{params, Row};

use super::{format_timestamp, parse_timestamp, Database, DatabaseError};
use crate::notify::Webhook;

fn from_row(row: &Row<'_>) -> Result<(Webhook, String, String), rusqlite::Error> {
    let created_at: String = row.get("created_at")?;
    let last_triggered_at: Option<String> = row.get("last_triggered_at")?;
    let webhook = Webhook {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        name: row.get("name")?,
        url: row.get("url")?,
        headers: Default::default(),
        events: Vec::new(),
        is_active: row.get("is_active")?,
        created_at: parse_timestamp(&created_at).unwrap_or_default(),
        last_triggered_at: last_triggered_at.as_deref().and_then(parse_timestamp),
    };
    Ok((webhook, row.get("headers")?, row.get("events")?))
}

fn decode(raw: (Webhook, String, String)) -> Result<Webhook, DatabaseError> {
    let (mut webhook, headers, events) = raw;
    webhook.headers = serde_json::from_str(&headers).map_err(|source| DatabaseError::Json {
        column: "headers",
        source,
    })?;
    webhook.events = serde_json::from_str(&events).map_err(|source| DatabaseError::Json {
        column: "events",
        source,
    })?;
    Ok(webhook)
}

pub fn insert(db: &Database, webhook: &Webhook) -> Result<(), DatabaseError> {
    let headers = serde_json::to_string(&webhook.headers).map_err(|source| {
        DatabaseError::Json {
            column: "headers",
            source,
        }
    })?;
    let events = serde_json::to_string(&webhook.events).map_err(|source| DatabaseError::Json {
        column: "events",
        source,
    })?;
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO webhooks (id, user_id, name, url, headers, events, is_active, created_at,
             last_triggered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                webhook.id,
                webhook.user_id,
                webhook.name,
                webhook.url,
                headers,
                events,
                webhook.is_active,
                format_timestamp(webhook.created_at),
                webhook.last_triggered_at.map(format_timestamp),
            ],
        )?;
        Ok(())
    })
}

/// Active webhooks of a user subscribed to `event`.
pub fn list_subscribed(
    db: &Database,
    user_id: &str,
    event: &str,
) -> Result<Vec<Webhook>, DatabaseError> {
    let rows = db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM webhooks WHERE user_id = ?1 AND is_active = 1 ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map(params![user_id], from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })?;

    let mut webhooks = Vec::with_capacity(rows.len());
    for raw in rows {
        let webhook = decode(raw)?;
        if webhook.events.iter().any(|e| e == event) {
            webhooks.push(webhook);
        }
    }
    Ok(webhooks)
}

pub fn mark_triggered(
    db: &Database,
    id: &str,
    at: &str,
    payload: &str,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE webhooks SET last_triggered_at = ?2, last_trigger_data = ?3 WHERE id = ?1",
            params![id, at, payload],
        )?;
        Ok(())
    })
}
