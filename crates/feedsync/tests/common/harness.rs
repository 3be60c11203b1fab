//! Isolated environment for job tests: an in-memory database, the real
//! job stack, and fakes at every network seam.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::Utc;

use feedsync::app::Services;
use feedsync::categorizer::{CategoryMatcher, ClassificationMode, Classifier};
use feedsync::db::{feed_repo, format_timestamp, Database};
use feedsync::feed::{Feed, FeedFetcher, Product, ProductStore, SqliteProductStore};
use feedsync::jobs::{BatchProcessor, Job, JobKind, JobLedger, JobOrigin, ProcessorSettings};
use feedsync::notify::WebhookNotifier;
use feedsync::taxonomy::{CategoryIndex, TaxonomyEntry};
use feedsync::Config;

use super::fakes::{FakeFetcher, FlakyStore, RecordingNotifier};

pub const USER_ID: &str = "user-1";

/// Defaults with every pause removed.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.batch.chunk_delay_ms = 0;
    config.queue.readmit_delay_ms = 0;
    config
}

pub fn test_index() -> Arc<CategoryIndex> {
    Arc::new(CategoryIndex::build(vec![
        TaxonomyEntry::new(1, "Jucării", "Jucării").with_child_count(2),
        TaxonomyEntry::new(2, "Puzzle", "Jucării > Puzzle"),
        TaxonomyEntry::new(3, "Mașinuțe", "Jucării > Mașinuțe"),
        TaxonomyEntry::new(4, "Cărți", "Cărți"),
    ]))
}

pub fn product(sku: &str, title: &str, categories: &[&str]) -> Product {
    Product {
        sku: sku.to_string(),
        title: title.to_string(),
        original_categories: categories.iter().map(|c| c.to_string()).collect(),
        ..Default::default()
    }
}

/// `n` products with SKUs `{prefix}-0000`, `{prefix}-0001`, ...
pub fn products(prefix: &str, n: usize) -> Vec<Product> {
    (0..n)
        .map(|i| product(&format!("{}-{:04}", prefix, i), &format!("Item {}", i), &["Puzzle"]))
        .collect()
}

pub struct TestEnv {
    pub config: Config,
    pub db: Database,
    pub fetcher: Arc<FakeFetcher>,
    pub store: Arc<FlakyStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub classifier: Arc<Classifier>,
    pub services: Services,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::build(test_config(), FakeFetcher::new())
    }

    pub fn gated() -> Self {
        Self::build(test_config(), FakeFetcher::gated())
    }

    pub fn build(config: Config, fetcher: FakeFetcher) -> Self {
        let db = Database::open_in_memory().expect("Failed to open in-memory database");
        let fetcher = Arc::new(fetcher);
        let store = Arc::new(FlakyStore::new(SqliteProductStore::new(db.clone())));
        let notifier = Arc::new(RecordingNotifier::default());
        let classifier = Arc::new(
            Classifier::new(
                ClassificationMode::Index,
                CategoryMatcher::new(test_index()),
                None,
            )
            .expect("Index mode needs no oracle"),
        );

        let services = Services::assemble(
            &config,
            db.clone(),
            Arc::clone(&fetcher) as Arc<dyn FeedFetcher>,
            Arc::clone(&store) as Arc<dyn ProductStore>,
            Arc::clone(&classifier),
            Arc::clone(&notifier) as Arc<dyn WebhookNotifier>,
        );

        Self {
            config,
            db,
            fetcher,
            store,
            notifier,
            classifier,
            services,
        }
    }

    pub fn ledger(&self) -> &JobLedger {
        self.services.queue.ledger()
    }

    /// A processor sharing this environment's collaborators.
    pub fn processor(&self, settings: ProcessorSettings) -> BatchProcessor {
        BatchProcessor::new(
            JobLedger::new(self.db.clone()),
            Arc::clone(&self.fetcher) as Arc<dyn FeedFetcher>,
            Arc::clone(&self.store) as Arc<dyn ProductStore>,
            Arc::clone(&self.classifier),
            Arc::clone(&self.notifier) as Arc<dyn WebhookNotifier>,
            settings,
        )
    }

    /// Registers a feed and serves `products` at its URL.
    pub fn add_feed(&self, products: Vec<Product>) -> Feed {
        let mut feed = Feed::new(USER_ID, "Test feed", "");
        feed.url = format!("https://feeds.example.com/{}.xml", feed.id);
        feed_repo::insert(&self.db, &feed).expect("Failed to insert feed");
        self.fetcher.serve(&feed.url, products);
        feed
    }

    /// Schedules a job and moves it straight to `running`, bypassing the
    /// queue.
    pub fn start_job(&self, kind: JobKind, resource_key: &str) -> Job {
        let ledger = self.ledger();
        let job = ledger
            .schedule(kind, resource_key, JobOrigin::Manual)
            .expect("Failed to schedule job");
        assert!(ledger.try_start(&job.id, 1000).unwrap());
        ledger.require(&job.id).unwrap()
    }

    /// Pushes the job's last progress `minutes` into the past.
    pub fn backdate(&self, job_id: &str, minutes: i64) {
        let at = format_timestamp(Utc::now() - chrono::Duration::minutes(minutes));
        self.db
            .with_conn(|conn| {
                Ok(conn.execute(
                    "UPDATE jobs SET started_at = ?1, progress_at = ?1 WHERE id = ?2",
                    rusqlite::params![at, job_id],
                )?)
            })
            .unwrap();
    }
}
