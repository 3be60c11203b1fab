//! Source feeds, their products, and where products are stored.

mod fetch;
mod model;
mod parse;
mod store;

pub use fetch::{FeedFetcher, HttpFeedFetcher};
pub use model::{
    Classification, Feed, FeedStatus, ProcessingStats, Product, StoredProduct,
    DEFAULT_SYNC_INTERVAL_SECS, UNCATEGORIZED_KEY, UNCATEGORIZED_TITLE,
};
pub use parse::parse_feed;
pub use store::{ProductStore, SqliteProductStore};
