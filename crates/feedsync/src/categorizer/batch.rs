//! Batched classification through the oracle.
//!
//! Every call returns exactly one outcome per input product, in input
//! order. Oracle failures are retried per batch; once the retries are
//! exhausted the whole batch falls back to "no match".

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::Instrument;

use super::oracle::ClassificationOracle;
use super::MatchType;
use crate::error::OracleError;
use crate::feed::{Classification, Product};
use crate::retry::RetryPolicy;
use crate::taxonomy::normalize::{keywords, normalize};
use crate::taxonomy::{CategoryIndex, TaxonomyEntry};

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub batch_size: usize,
    /// Minimum spacing between two oracle batches.
    pub rate_limit_delay: Duration,
    pub retry: RetryPolicy,
    /// Replies below this confidence are discarded.
    pub min_confidence: f64,
    /// When set, only the best keyword-ranked leaves are offered to the
    /// oracle instead of every leaf.
    pub max_prompt_candidates: Option<usize>,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            batch_size: 20,
            rate_limit_delay: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            min_confidence: 0.3,
            max_prompt_candidates: None,
        }
    }
}

/// Classification result for one product of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutcome {
    pub product_index: usize,
    pub matched: Option<OracleMatch>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OracleMatch {
    pub entry: TaxonomyEntry,
    pub confidence: f64,
}

impl MatchOutcome {
    fn none(product_index: usize) -> Self {
        Self {
            product_index,
            matched: None,
        }
    }

    /// The classification to store; unmatched products become Uncategorized.
    pub fn to_classification(&self) -> Classification {
        match &self.matched {
            Some(m) => Classification::from_entry(&m.entry, MatchType::Oracle, m.confidence),
            None => Classification::uncategorized(),
        }
    }
}

/// One element of the oracle's JSON reply.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReplyItem {
    product_index: Option<serde_json::Value>,
    category_id: Option<serde_json::Value>,
    #[serde(default)]
    confidence: Option<f64>,
}

fn as_u64(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub struct AiBatchCategorizer {
    oracle: Arc<dyn ClassificationOracle>,
    index: Arc<CategoryIndex>,
    settings: BatchSettings,
    last_batch: Mutex<Option<Instant>>,
}

impl AiBatchCategorizer {
    pub fn new(
        oracle: Arc<dyn ClassificationOracle>,
        index: Arc<CategoryIndex>,
        settings: BatchSettings,
    ) -> Self {
        Self {
            oracle,
            index,
            settings,
            last_batch: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.settings
    }

    /// Classifies `products`, splitting them into oracle batches.
    pub async fn classify_batch(&self, products: &[Product]) -> Vec<MatchOutcome> {
        let mut outcomes = Vec::with_capacity(products.len());
        let size = self.settings.batch_size.max(1);

        for (batch_no, chunk) in products.chunks(size).enumerate() {
            let offset = batch_no * size;
            let span = tracing::info_span!("oracle_batch", batch = batch_no, size = chunk.len());
            let batch = self.classify_chunk(chunk).instrument(span).await;
            outcomes.extend(batch.into_iter().map(|mut o| {
                o.product_index += offset;
                o
            }));
        }

        outcomes
    }

    async fn classify_chunk(&self, products: &[Product]) -> Vec<MatchOutcome> {
        let candidates = self.candidates(products);
        if candidates.is_empty() {
            log::warn!("No leaf taxonomy entries to offer the oracle; batch left unmatched");
            return (0..products.len()).map(MatchOutcome::none).collect();
        }

        let prompt = build_prompt(products, &candidates);
        self.pace().await;

        let oracle = &self.oracle;
        let prompt = prompt.as_str();
        let reply = self
            .settings
            .retry
            .run("Oracle batch", |_| async move {
                let text = oracle.generate(prompt).await?;
                parse_reply(&text)
            })
            .await;

        match reply {
            Ok(items) => self.validate(products.len(), items),
            Err(e) => {
                log::error!(
                    "Oracle batch of {} products failed, falling back to Uncategorized: {}",
                    products.len(),
                    e
                );
                (0..products.len()).map(MatchOutcome::none).collect()
            }
        }
    }

    /// Waits until the rate-limit delay since the previous batch has passed.
    async fn pace(&self) {
        let mut last = self.last_batch.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.settings.rate_limit_delay;
            if Instant::now() < ready_at {
                log::debug!(
                    "Waiting {:?} before next oracle batch",
                    ready_at - Instant::now()
                );
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }

    fn candidates(&self, products: &[Product]) -> Vec<&TaxonomyEntry> {
        match self.settings.max_prompt_candidates {
            Some(limit) => {
                let text: Vec<String> = products
                    .iter()
                    .flat_map(|p| {
                        std::iter::once(normalize(&p.title))
                            .chain(p.original_categories.iter().map(|c| normalize(c)))
                    })
                    .collect();
                let words = text.iter().flat_map(|t| keywords(t));
                let mut ranked = self.index.rank_by_keywords(words, limit, |e| e.is_leaf());
                if ranked.is_empty() {
                    ranked = self.index.leaves().take(limit).collect();
                }
                ranked
            }
            None => self.index.leaves().collect(),
        }
    }

    fn validate(&self, count: usize, items: Vec<ReplyItem>) -> Vec<MatchOutcome> {
        let mut by_product: HashMap<usize, OracleMatch> = HashMap::new();

        for item in items {
            let Some(index) = item.product_index.as_ref().and_then(as_u64) else {
                continue;
            };
            let index = index as usize;
            if index >= count || by_product.contains_key(&index) {
                continue;
            }
            let Some(key) = item.category_id.as_ref().and_then(as_u64) else {
                continue;
            };
            let confidence = item.confidence.unwrap_or(0.0);
            if confidence < self.settings.min_confidence {
                log::debug!(
                    "Discarding oracle answer for product {}: confidence {:.2}",
                    index,
                    confidence
                );
                continue;
            }
            match u32::try_from(key).ok().and_then(|k| self.index.get(k)) {
                Some(entry) if entry.is_leaf() => {
                    by_product.insert(
                        index,
                        OracleMatch {
                            entry: entry.clone(),
                            confidence: confidence.clamp(0.0, 1.0),
                        },
                    );
                }
                _ => {
                    log::debug!(
                        "Discarding oracle answer for product {}: {} is not a leaf category",
                        index,
                        key
                    );
                }
            }
        }

        (0..count)
            .map(|i| MatchOutcome {
                product_index: i,
                matched: by_product.remove(&i),
            })
            .collect()
    }
}

fn build_prompt(products: &[Product], candidates: &[&TaxonomyEntry]) -> String {
    let mut prompt = String::from(
        "You are a product categorization expert. Match each product to the most \
         specific category from the list below.\n\nProducts to categorize:\n",
    );
    for (i, product) in products.iter().enumerate() {
        let _ = writeln!(
            prompt,
            "{}: \"{}\" - Categories: [{}]",
            i,
            product.title,
            product.original_categories.join(", ")
        );
    }

    prompt.push_str("\nAvailable categories:\n");
    for entry in candidates {
        let _ = writeln!(prompt, "- {} (ID: {}) [{}]", entry.title, entry.key, entry.path);
    }

    prompt.push_str(
        "\nReturn a JSON array with format:\n\
         [{\"productIndex\": 0, \"categoryId\": 123, \"categoryTitle\": \"Category Name\", \"confidence\": 0.95}]\n\n\
         Only return the JSON array, no other text.",
    );
    prompt
}

fn parse_reply(reply: &str) -> Result<Vec<ReplyItem>, OracleError> {
    let stripped = reply.replace("```json", "").replace("```", "");
    let json = extract_json_array(&stripped)
        .ok_or_else(|| OracleError::ResponseParse("no JSON array in reply".to_string()))?;

    let values: Vec<serde_json::Value> =
        serde_json::from_str(json).map_err(|e| OracleError::ResponseParse(e.to_string()))?;
    Ok(values
        .into_iter()
        .filter_map(|v| serde_json::from_value(v).ok())
        .collect())
}

/// Finds the first balanced `[...]` in `text`, ignoring brackets inside
/// JSON strings.
fn extract_json_array(text: &str) -> Option<&str> {
    let start = text.find('[')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in text[start..].char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '[' if !in_string => depth += 1,
            ']' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_array() {
        let reply = "Sure! Here it is:\n[{\"a\": \"x]\"}, {\"b\": [1, 2]}] trailing";
        assert_eq!(
            extract_json_array(reply),
            Some("[{\"a\": \"x]\"}, {\"b\": [1, 2]}]")
        );
        assert!(extract_json_array("no array").is_none());
        assert!(extract_json_array("[unterminated").is_none());
    }

    #[test]
    fn test_parse_reply_strips_fences() {
        let reply = "```json\n[{\"productIndex\": 0, \"categoryId\": \"12\", \"confidence\": 0.9}]\n```";
        let items = parse_reply(reply).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].category_id.as_ref().and_then(as_u64), Some(12));
    }

    #[test]
    fn test_parse_reply_rejects_prose() {
        assert!(matches!(
            parse_reply("I cannot help with that."),
            Err(OracleError::ResponseParse(_))
        ));
    }

    #[test]
    fn test_prompt_lists_products_and_candidates() {
        let products = vec![Product {
            title: "Puzzle 1000".to_string(),
            original_categories: vec!["Puzzle".to_string()],
            ..Default::default()
        }];
        let entry = TaxonomyEntry::new(7, "Puzzle 3D", "Toys > Puzzle 3D");
        let prompt = build_prompt(&products, &[&entry]);
        assert!(prompt.contains("0: \"Puzzle 1000\" - Categories: [Puzzle]"));
        assert!(prompt.contains("- Puzzle 3D (ID: 7)"));
        assert!(prompt.contains("productIndex"));
    }
}
