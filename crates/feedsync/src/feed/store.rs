use async_trait::async_trait;

use super::{Classification, ProcessingStats, Product, StoredProduct};
use crate::db::{now_timestamp, product_repo, Database};
use crate::error::StoreError;

/// Persistent product storage used by sync and categorize jobs.
///
/// Implementations report [`StoreError::Rejected`] for a single bad item
/// and [`StoreError::Unavailable`] when the store itself is unusable.
#[async_trait]
pub trait ProductStore: Send + Sync {
    /// Inserts or refreshes a feed product, keeping any classification it
    /// already has. Returns the store id.
    async fn upsert(&self, feed_id: &str, product: &Product) -> Result<String, StoreError>;

    async fn unclassified(
        &self,
        feed_id: Option<&str>,
        limit: u64,
    ) -> Result<Vec<StoredProduct>, StoreError>;

    async fn set_classification(
        &self,
        product_id: &str,
        classification: &Classification,
    ) -> Result<(), StoreError>;

    async fn processing_stats(&self, feed_id: Option<&str>) -> Result<ProcessingStats, StoreError>;
}

/// [`ProductStore`] over the local SQLite database.
#[derive(Clone)]
pub struct SqliteProductStore {
    db: Database,
}

impl SqliteProductStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ProductStore for SqliteProductStore {
    async fn upsert(&self, feed_id: &str, product: &Product) -> Result<String, StoreError> {
        let id = product.store_id(feed_id);
        product_repo::upsert(&self.db, feed_id, product, &now_timestamp())
            .map_err(|e| StoreError::from(e).for_product(&id))
    }

    async fn unclassified(
        &self,
        feed_id: Option<&str>,
        limit: u64,
    ) -> Result<Vec<StoredProduct>, StoreError> {
        Ok(product_repo::list_unclassified(&self.db, feed_id, limit)?)
    }

    async fn set_classification(
        &self,
        product_id: &str,
        classification: &Classification,
    ) -> Result<(), StoreError> {
        let updated =
            product_repo::set_classification(&self.db, product_id, classification, &now_timestamp())
                .map_err(|e| StoreError::from(e).for_product(product_id))?;
        if updated {
            Ok(())
        } else {
            Err(StoreError::Rejected {
                id: product_id.to_string(),
                reason: "product not found".to_string(),
            })
        }
    }

    async fn processing_stats(&self, feed_id: Option<&str>) -> Result<ProcessingStats, StoreError> {
        Ok(product_repo::stats(&self.db, feed_id)?)
    }
}
