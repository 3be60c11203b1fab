//! Wiring from a [`Config`] to running services.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::categorizer::{
    AiBatchCategorizer, CategoryMatcher, ClassificationMode, ClassificationOracle, Classifier,
    HttpOracle,
};
use crate::config::Config;
use crate::db::Database;
use crate::error::{ConfigError, Result};
use crate::feed::{FeedFetcher, HttpFeedFetcher, ProductStore, SqliteProductStore};
use crate::jobs::{BatchProcessor, JobLedger, JobQueue};
use crate::notify::{HttpWebhookNotifier, NoopNotifier, WebhookNotifier};
use crate::scheduler::{ScheduleTrigger, Scheduler};
use crate::taxonomy::{load_taxonomy, CategoryIndex};

const FEED_FETCH_TIMEOUT: Duration = Duration::from_secs(120);

pub fn open_database(config: &Config) -> Result<Database> {
    let path = config.database.resolved_path().ok_or_else(|| ConfigError::Validation {
        message: "database.path is not set and no home directory was found".to_string(),
    })?;
    Ok(Database::open(&path)?)
}

/// Loads the category index, preferring the prebuilt file when it exists.
pub fn load_index(config: &Config) -> Result<CategoryIndex> {
    if let Some(index_path) = &config.taxonomy.index_path {
        if index_path.exists() {
            return Ok(CategoryIndex::load(index_path)?);
        }
    }
    match &config.taxonomy.path {
        Some(path) => build_index(path),
        None => Err(ConfigError::Validation {
            message: "taxonomy.path or an existing taxonomy.indexPath is required".to_string(),
        }
        .into()),
    }
}

pub fn build_index(taxonomy_path: &Path) -> Result<CategoryIndex> {
    let entries = load_taxonomy(taxonomy_path)?;
    let index = CategoryIndex::build(entries);
    log::info!(
        "Built category index: {} entries, {} keywords",
        index.len(),
        index.keyword_count()
    );
    Ok(index)
}

fn build_classifier(config: &Config, index: Arc<CategoryIndex>) -> Result<Classifier> {
    let matcher = CategoryMatcher::with_stoplist(Arc::clone(&index), &config.categorizer.stoplist);
    let mode = config.categorizer.mode;

    let ai = if mode == ClassificationMode::Index {
        None
    } else {
        let oracle = &config.oracle;
        let api_key = oracle.api_key.resolve()?;
        let oracle: Arc<dyn ClassificationOracle> = Arc::new(HttpOracle::new(
            &oracle.endpoint,
            &oracle.model,
            api_key,
            Duration::from_secs(oracle.timeout_secs),
        )?);
        Some(Arc::new(AiBatchCategorizer::new(
            oracle,
            index,
            config.batch_settings(),
        )))
    };

    Ok(Classifier::new(mode, matcher, ai)?)
}

/// Everything a running instance needs, sharing one database.
pub struct Services {
    pub db: Database,
    pub store: Arc<dyn ProductStore>,
    pub queue: Arc<JobQueue>,
    pub scheduler: Arc<Scheduler>,
}

impl Services {
    pub fn build(config: &Config, db: Database, index: CategoryIndex) -> Result<Self> {
        let fetcher: Arc<dyn FeedFetcher> = Arc::new(HttpFeedFetcher::new(FEED_FETCH_TIMEOUT)?);
        let store: Arc<dyn ProductStore> = Arc::new(SqliteProductStore::new(db.clone()));
        let notifier: Arc<dyn WebhookNotifier> = if config.webhooks.enabled {
            Arc::new(HttpWebhookNotifier::new(
                db.clone(),
                Duration::from_secs(config.webhooks.timeout_secs),
            )?)
        } else {
            Arc::new(NoopNotifier)
        };
        let classifier = Arc::new(build_classifier(config, Arc::new(index))?);

        Ok(Self::assemble(config, db, fetcher, store, classifier, notifier))
    }

    /// Builds the job stack around caller-provided collaborators.
    pub fn assemble(
        config: &Config,
        db: Database,
        fetcher: Arc<dyn FeedFetcher>,
        store: Arc<dyn ProductStore>,
        classifier: Arc<Classifier>,
        notifier: Arc<dyn WebhookNotifier>,
    ) -> Self {
        let processor = Arc::new(BatchProcessor::new(
            JobLedger::new(db.clone()),
            fetcher,
            Arc::clone(&store),
            classifier,
            notifier,
            config.processor_settings(),
        ));
        let queue = JobQueue::new(processor, config.queue_settings());
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&queue),
            Arc::clone(&store),
            config.reaper.max_age_minutes,
        ));
        Self {
            db,
            store,
            queue,
            scheduler,
        }
    }

    pub fn trigger(&self, config: &Config) -> ScheduleTrigger {
        ScheduleTrigger::new(Arc::clone(&self.scheduler), config.trigger_intervals())
    }
}
