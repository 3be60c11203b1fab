//! Product repository: the `products` table.
//!
//! Feed columns and classification columns are written separately. A
//! re-sync overwrites what the feed says about a product but never the
//! classification already assigned to it.

use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use serde::de::DeserializeOwned;

use super::{parse_timestamp, Database, DatabaseError};
use crate::categorizer::MatchType;
use crate::feed::{Classification, ProcessingStats, Product, StoredProduct};

fn json_column<T: DeserializeOwned>(row: &Row<'_>, name: &str) -> Result<T, rusqlite::Error> {
    let raw: String = row.get(name)?;
    serde_json::from_str(&raw).map_err(|e| {
        let idx = row.as_ref().column_index(name).unwrap_or(0);
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
    })
}

fn from_row(row: &Row<'_>) -> Result<StoredProduct, rusqlite::Error> {
    let product = Product {
        id: row.get("source_id")?,
        sku: row.get("sku")?,
        title: row.get("title")?,
        description: row.get("description")?,
        link: row.get("link")?,
        price: row.get("price")?,
        availability: row.get("availability")?,
        brand: row.get("brand")?,
        image: row.get("image")?,
        gtin: row.get("gtin")?,
        mpn: row.get("mpn")?,
        stock_quantity: row.get("stock_quantity")?,
        original_categories: json_column(row, "original_categories")?,
        extra: json_column(row, "extra")?,
    };

    let key: Option<u32> = row.get("taxonomy_key")?;
    let classification = match key {
        Some(key) => {
            let match_type: Option<String> = row.get("match_type")?;
            Some(Classification {
                key,
                title: row.get::<_, Option<String>>("taxonomy_title")?.unwrap_or_default(),
                path: row.get::<_, Option<String>>("taxonomy_path")?.unwrap_or_default(),
                match_type: match_type
                    .as_deref()
                    .and_then(MatchType::parse)
                    .unwrap_or(MatchType::Fallback),
                confidence: row.get::<_, Option<f64>>("match_confidence")?.unwrap_or(0.0),
            })
        }
        None => None,
    };

    let last_updated: String = row.get("last_updated")?;
    Ok(StoredProduct {
        id: row.get("id")?,
        feed_id: row.get("feed_id")?,
        product,
        category_processed: row.get("category_processed")?,
        classification,
        last_updated: parse_timestamp(&last_updated).unwrap_or_default(),
    })
}

fn encode<T: serde::Serialize>(column: &'static str, value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|source| DatabaseError::Json { column, source })
}

/// Inserts or refreshes a product from a feed. Returns the store id.
pub fn upsert(
    db: &Database,
    feed_id: &str,
    product: &Product,
    now: &str,
) -> Result<String, DatabaseError> {
    let id = product.store_id(feed_id);
    let categories = encode("original_categories", &product.original_categories)?;
    let extra = encode("extra", &product.extra)?;

    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO products (id, feed_id, source_id, sku, title, description, link, price,
                 availability, brand, image, gtin, mpn, stock_quantity, original_categories,
                 extra, created_at, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                 ?17, ?17)
             ON CONFLICT(id) DO UPDATE SET
                 source_id = excluded.source_id, sku = excluded.sku, title = excluded.title,
                 description = excluded.description, link = excluded.link,
                 price = excluded.price, availability = excluded.availability,
                 brand = excluded.brand, image = excluded.image, gtin = excluded.gtin,
                 mpn = excluded.mpn, stock_quantity = excluded.stock_quantity,
                 original_categories = excluded.original_categories,
                 extra = excluded.extra, last_updated = excluded.last_updated",
            params![
                id,
                feed_id,
                product.id,
                product.sku,
                product.title,
                product.description,
                product.link,
                product.price,
                product.availability,
                product.brand,
                product.image,
                product.gtin,
                product.mpn,
                product.stock_quantity,
                categories,
                extra,
                now,
            ],
        )?;
        Ok(())
    })?;
    Ok(id)
}

pub fn find_by_id(db: &Database, id: &str) -> Result<Option<StoredProduct>, DatabaseError> {
    db.with_conn(|conn| {
        let product = conn
            .query_row("SELECT * FROM products WHERE id = ?1", params![id], from_row)
            .optional()?;
        Ok(product)
    })
}

pub fn list_by_feed(db: &Database, feed_id: &str) -> Result<Vec<StoredProduct>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM products WHERE feed_id = ?1 ORDER BY id")?;
        let rows = stmt
            .query_map(params![feed_id], from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Products still waiting for classification, oldest first.
pub fn list_unclassified(
    db: &Database,
    feed_id: Option<&str>,
    limit: u64,
) -> Result<Vec<StoredProduct>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM products
             WHERE category_processed = 0 AND (?1 IS NULL OR feed_id = ?1)
             ORDER BY created_at ASC, id ASC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![feed_id, limit as i64], from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Writes the classification of a product and marks it processed.
pub fn set_classification(
    db: &Database,
    id: &str,
    classification: &Classification,
    now: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let updated = conn.execute(
            "UPDATE products SET category_processed = 1, taxonomy_key = ?2,
                 taxonomy_title = ?3, taxonomy_path = ?4, match_type = ?5,
                 match_confidence = ?6, category_updated_at = ?7
             WHERE id = ?1",
            params![
                id,
                classification.key,
                classification.title,
                classification.path,
                classification.match_type.as_str(),
                classification.confidence,
                now,
            ],
        )?;
        Ok(updated == 1)
    })
}

pub fn stats(db: &Database, feed_id: Option<&str>) -> Result<ProcessingStats, DatabaseError> {
    db.with_conn(|conn| {
        let (total, processed): (u64, u64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(category_processed), 0) FROM products
             WHERE ?1 IS NULL OR feed_id = ?1",
            params![feed_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        Ok(ProcessingStats::new(total, processed))
    })
}
