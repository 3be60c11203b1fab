use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::categorizer::MatchType;
use crate::taxonomy::TaxonomyEntry;

/// Key of the fallback classification.
pub const UNCATEGORIZED_KEY: u32 = 0;
pub const UNCATEGORIZED_TITLE: &str = "Uncategorized";

/// Registered source feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feed {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub url: String,
    pub status: FeedStatus,
    pub is_paused: bool,
    pub sync_interval_secs: u64,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedStatus {
    Active,
    Inactive,
}

impl FeedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedStatus::Active => "active",
            FeedStatus::Inactive => "inactive",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "active" => FeedStatus::Active,
            _ => FeedStatus::Inactive,
        }
    }
}

/// Default sync interval: one hour.
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 3600;

impl Feed {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>, url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            name: name.into(),
            url: url.into(),
            status: FeedStatus::Active,
            is_paused: false,
            sync_interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            last_sync_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the periodic scheduler should sync this feed at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if self.status != FeedStatus::Active || self.is_paused {
            return false;
        }
        match self.last_sync_at {
            None => true,
            Some(last) => {
                let elapsed = now.signed_duration_since(last);
                elapsed.num_seconds() >= self.sync_interval_secs as i64
            }
        }
    }
}

/// A product as it appears in a source feed.
///
/// The named fields are the ones the system understands; every other
/// element of the source record is carried in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Product {
    pub id: String,
    pub sku: String,
    pub title: String,
    pub description: String,
    pub link: String,
    pub price: String,
    pub availability: String,
    pub brand: String,
    pub image: String,
    pub gtin: String,
    pub mpn: String,
    pub stock_quantity: i64,
    pub original_categories: Vec<String>,
    pub extra: BTreeMap<String, String>,
}

impl Product {
    /// Stable store id: `{feed_id}_{sku}`, falling back to the source id.
    pub fn store_id(&self, feed_id: &str) -> String {
        let local = if self.sku.is_empty() {
            &self.id
        } else {
            &self.sku
        };
        format!("{}_{}", feed_id, local)
    }
}

/// Taxonomy assignment folded into a stored product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub key: u32,
    pub title: String,
    pub path: String,
    pub match_type: MatchType,
    pub confidence: f64,
}

impl Classification {
    pub fn from_entry(entry: &TaxonomyEntry, match_type: MatchType, confidence: f64) -> Self {
        Self {
            key: entry.key,
            title: entry.title.clone(),
            path: entry.path.clone(),
            match_type,
            confidence,
        }
    }

    pub fn uncategorized() -> Self {
        Self {
            key: UNCATEGORIZED_KEY,
            title: UNCATEGORIZED_TITLE.to_string(),
            path: UNCATEGORIZED_TITLE.to_string(),
            match_type: MatchType::Fallback,
            confidence: 0.0,
        }
    }

    pub fn is_uncategorized(&self) -> bool {
        self.key == UNCATEGORIZED_KEY
    }
}

/// A product as persisted by the product store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredProduct {
    pub id: String,
    pub feed_id: String,
    pub product: Product,
    pub category_processed: bool,
    pub classification: Option<Classification>,
    pub last_updated: DateTime<Utc>,
}

/// Classification progress over a set of stored products.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingStats {
    pub total: u64,
    pub processed: u64,
    pub unprocessed: u64,
    pub percentage: u32,
}

impl ProcessingStats {
    pub fn new(total: u64, processed: u64) -> Self {
        let percentage = if total > 0 {
            ((processed as f64 / total as f64) * 100.0).round() as u32
        } else {
            0
        };
        Self {
            total,
            processed,
            unprocessed: total.saturating_sub(processed),
            percentage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_id_prefers_sku() {
        let mut product = Product {
            id: "42".to_string(),
            sku: "SKU-1".to_string(),
            ..Default::default()
        };
        assert_eq!(product.store_id("feed"), "feed_SKU-1");
        product.sku.clear();
        assert_eq!(product.store_id("feed"), "feed_42");
    }

    #[test]
    fn test_feed_due() {
        let now = Utc::now();
        let mut feed = Feed::new("u1", "Shop", "https://example.com/feed.xml");
        assert!(feed.is_due(now));

        feed.last_sync_at = Some(now - chrono::Duration::minutes(30));
        assert!(!feed.is_due(now));

        feed.last_sync_at = Some(now - chrono::Duration::hours(2));
        assert!(feed.is_due(now));

        feed.is_paused = true;
        assert!(!feed.is_due(now));
        feed.is_paused = false;
        feed.status = FeedStatus::Inactive;
        assert!(!feed.is_due(now));
    }

    #[test]
    fn test_processing_stats() {
        let stats = ProcessingStats::new(3, 2);
        assert_eq!(stats.unprocessed, 1);
        assert_eq!(stats.percentage, 67);
        assert_eq!(ProcessingStats::new(0, 0).percentage, 0);
    }

    #[test]
    fn test_uncategorized() {
        let fallback = Classification::uncategorized();
        assert!(fallback.is_uncategorized());
        assert_eq!(fallback.path, "Uncategorized");
        assert_eq!(fallback.match_type, MatchType::Fallback);
    }
}
