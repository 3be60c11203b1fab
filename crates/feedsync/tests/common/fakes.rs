//! In-process stand-ins for the network-facing collaborators.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use feedsync::categorizer::ClassificationOracle;
use feedsync::feed::{
    Classification, ProcessingStats, Product, ProductStore, SqliteProductStore, StoredProduct,
};
use feedsync::notify::{WebhookEvent, WebhookNotifier};
use feedsync::{FetchError, OracleError, ParseError, StoreError};

/// Serves product lists registered per URL. Bodies are JSON, decoded by
/// the overridden `parse`.
///
/// A gated fetcher blocks every fetch until a permit is released, which
/// keeps admitted jobs `running` for as long as a test needs.
pub struct FakeFetcher {
    feeds: Mutex<HashMap<String, Vec<Product>>>,
    gate: Option<Semaphore>,
    fetches: AtomicUsize,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self {
            feeds: Mutex::new(HashMap::new()),
            gate: None,
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::new()
        }
    }

    pub fn serve(&self, url: &str, products: Vec<Product>) {
        self.feeds
            .lock()
            .unwrap()
            .insert(url.to_string(), products);
    }

    /// Lets `n` blocked (or future) fetches through.
    pub fn open_gate(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl feedsync::feed::FeedFetcher for FakeFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let products = self.feeds.lock().unwrap().get(url).cloned();
        match products {
            Some(products) => Ok(serde_json::to_vec(&products).unwrap()),
            None => Err(FetchError::Status {
                url: url.to_string(),
                status: 404,
            }),
        }
    }

    fn parse(&self, body: &[u8]) -> Result<Vec<Product>, ParseError> {
        serde_json::from_slice(body).map_err(|e| ParseError::Xml {
            position: 0,
            message: e.to_string(),
        })
    }
}

type Hook = Box<dyn FnOnce() + Send>;

/// The SQLite store, recording every upsert and able to go down on a
/// chosen call or run a hook just before it.
pub struct FlakyStore {
    inner: SqliteProductStore,
    upserts: Mutex<Vec<String>>,
    fail_upsert_at: Mutex<Option<usize>>,
    before_upsert: Mutex<Option<(usize, Hook)>>,
}

impl FlakyStore {
    pub fn new(inner: SqliteProductStore) -> Self {
        Self {
            inner,
            upserts: Mutex::new(Vec::new()),
            fail_upsert_at: Mutex::new(None),
            before_upsert: Mutex::new(None),
        }
    }

    /// Runs `hook` once, right before the `call`-th upsert (1-based).
    pub fn before_upsert(&self, call: usize, hook: impl FnOnce() + Send + 'static) {
        *self.before_upsert.lock().unwrap() = Some((call, Box::new(hook)));
    }

    /// Makes the `call`-th upsert (1-based) fail as unavailable.
    pub fn fail_upsert_at(&self, call: usize) {
        *self.fail_upsert_at.lock().unwrap() = Some(call);
    }

    /// Store ids of the successful upserts, in call order.
    pub fn upserted(&self) -> Vec<String> {
        self.upserts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProductStore for FlakyStore {
    async fn upsert(&self, feed_id: &str, product: &Product) -> Result<String, StoreError> {
        let call = self.upserts.lock().unwrap().len() + 1;
        let hook = {
            let mut slot = self.before_upsert.lock().unwrap();
            match slot.take() {
                Some((at, hook)) if at == call => Some(hook),
                other => {
                    *slot = other;
                    None
                }
            }
        };
        if let Some(hook) = hook {
            hook();
        }
        if *self.fail_upsert_at.lock().unwrap() == Some(call) {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        let id = self.inner.upsert(feed_id, product).await?;
        self.upserts.lock().unwrap().push(id.clone());
        Ok(id)
    }

    async fn unclassified(
        &self,
        feed_id: Option<&str>,
        limit: u64,
    ) -> Result<Vec<StoredProduct>, StoreError> {
        self.inner.unclassified(feed_id, limit).await
    }

    async fn set_classification(
        &self,
        product_id: &str,
        classification: &Classification,
    ) -> Result<(), StoreError> {
        self.inner.set_classification(product_id, classification).await
    }

    async fn processing_stats(&self, feed_id: Option<&str>) -> Result<ProcessingStats, StoreError> {
        self.inner.processing_stats(feed_id).await
    }
}

/// Oracle answering from a script; an exhausted script is a transport
/// failure.
pub struct ScriptedOracle {
    replies: Mutex<VecDeque<Result<String, OracleError>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedOracle {
    pub fn new(replies: Vec<Result<String, OracleError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self::new(Vec::new())
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClassificationOracle for ScriptedOracle {
    async fn generate(&self, prompt: &str) -> Result<String, OracleError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(OracleError::Transport("connection reset".to_string())))
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<(String, WebhookEvent)>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<(String, WebhookEvent)> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl WebhookNotifier for RecordingNotifier {
    async fn notify(&self, user_id: &str, event: &WebhookEvent) {
        self.events
            .lock()
            .unwrap()
            .push((user_id.to_string(), event.clone()));
    }
}
