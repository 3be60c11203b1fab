//! Product classification against the taxonomy.
//!
//! Two engines are available: the deterministic [`CategoryMatcher`] over
//! the prebuilt index, and the [`AiBatchCategorizer`] that asks an oracle.
//! [`Classifier`] combines them according to [`ClassificationMode`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};

mod batch;
mod matcher;
pub mod oracle;

pub use batch::{AiBatchCategorizer, BatchSettings, MatchOutcome, OracleMatch};
pub use matcher::{CategoryMatch, CategoryMatcher, ACCEPTANCE_FLOOR, DEFAULT_STOPLIST, FUZZY_THRESHOLD};
pub use oracle::{ClassificationOracle, HttpOracle};

use crate::error::OracleError;
use crate::feed::{Classification, Product};

/// How a classification was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Exact,
    Fuzzy,
    Keyword,
    Oracle,
    /// No match; the product was filed as Uncategorized.
    Fallback,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Exact => "exact",
            MatchType::Fuzzy => "fuzzy",
            MatchType::Keyword => "keyword",
            MatchType::Oracle => "oracle",
            MatchType::Fallback => "fallback",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "exact" => Some(MatchType::Exact),
            "fuzzy" => Some(MatchType::Fuzzy),
            "keyword" => Some(MatchType::Keyword),
            "oracle" => Some(MatchType::Oracle),
            "fallback" => Some(MatchType::Fallback),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClassificationMode {
    /// Index lookup only.
    #[default]
    Index,
    /// Oracle only.
    Oracle,
    /// Index first; only the misses go to the oracle.
    IndexThenOracle,
}

/// Classifies products into exactly one classification each.
pub struct Classifier {
    mode: ClassificationMode,
    matcher: CategoryMatcher,
    ai: Option<Arc<AiBatchCategorizer>>,
}

impl Classifier {
    pub fn new(
        mode: ClassificationMode,
        matcher: CategoryMatcher,
        ai: Option<Arc<AiBatchCategorizer>>,
    ) -> Result<Self, OracleError> {
        if mode != ClassificationMode::Index && ai.is_none() {
            return Err(OracleError::NotConfigured);
        }
        Ok(Self { mode, matcher, ai })
    }

    pub fn mode(&self) -> ClassificationMode {
        self.mode
    }

    pub fn matcher(&self) -> &CategoryMatcher {
        &self.matcher
    }

    /// One classification per product, in order. Products nothing could
    /// place are Uncategorized.
    pub async fn classify(&self, products: &[Product]) -> Vec<Classification> {
        match (self.mode, &self.ai) {
            (ClassificationMode::Oracle, Some(ai)) => ai
                .classify_batch(products)
                .await
                .iter()
                .map(MatchOutcome::to_classification)
                .collect(),
            (ClassificationMode::IndexThenOracle, Some(ai)) => {
                let mut results: Vec<Option<Classification>> = products
                    .iter()
                    .map(|p| self.matcher.classify(&p.original_categories))
                    .collect();

                let misses: Vec<usize> = results
                    .iter()
                    .enumerate()
                    .filter(|(_, r)| r.is_none())
                    .map(|(i, _)| i)
                    .collect();
                if !misses.is_empty() {
                    log::debug!(
                        "{} of {} products missed the index, asking the oracle",
                        misses.len(),
                        products.len()
                    );
                    let pending: Vec<Product> =
                        misses.iter().map(|&i| products[i].clone()).collect();
                    let outcomes = ai.classify_batch(&pending).await;
                    for outcome in outcomes {
                        if let Some(&target) = misses.get(outcome.product_index) {
                            results[target] = Some(outcome.to_classification());
                        }
                    }
                }

                results
                    .into_iter()
                    .map(|r| r.unwrap_or_else(Classification::uncategorized))
                    .collect()
            }
            _ => products
                .iter()
                .map(|p| {
                    self.matcher
                        .classify(&p.original_categories)
                        .unwrap_or_else(Classification::uncategorized)
                })
                .collect(),
        }
    }
}
