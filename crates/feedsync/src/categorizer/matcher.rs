use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use strsim::normalized_levenshtein;

use super::MatchType;
use crate::feed::Classification;
use crate::taxonomy::normalize::{keywords, normalize};
use crate::taxonomy::{CategoryIndex, TaxonomyEntry};

/// Fuzzy candidates must be strictly more similar than this.
pub const FUZZY_THRESHOLD: f64 = 0.6;
/// Overall acceptance floor; keyword overlap must also exceed it.
pub const ACCEPTANCE_FLOOR: f64 = 0.3;

/// Umbrella terms that say nothing about the product.
pub const DEFAULT_STOPLIST: &[&str] = &["jucarii", "jocuri", "toate"];

/// Resolves informal feed categories to one taxonomy entry.
pub struct CategoryMatcher {
    index: Arc<CategoryIndex>,
    stoplist: HashSet<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CategoryMatch<'a> {
    pub entry: &'a TaxonomyEntry,
    pub match_type: MatchType,
    pub score: f64,
}

impl CategoryMatch<'_> {
    pub fn to_classification(&self) -> Classification {
        Classification::from_entry(self.entry, self.match_type, self.score)
    }
}

impl CategoryMatcher {
    pub fn new(index: Arc<CategoryIndex>) -> Self {
        Self::with_stoplist(index, DEFAULT_STOPLIST.iter().copied())
    }

    /// Stoplist terms are normalized before comparison.
    pub fn with_stoplist<I, S>(index: Arc<CategoryIndex>, stoplist: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let stoplist = stoplist
            .into_iter()
            .map(|s| normalize(s.as_ref()))
            .filter(|s| !s.is_empty())
            .collect();
        Self { index, stoplist }
    }

    pub fn index(&self) -> &Arc<CategoryIndex> {
        &self.index
    }

    /// Best taxonomy entry for a set of informal category strings.
    ///
    /// Each input is tried exact, then fuzzy, then by keyword overlap.
    /// Among the inputs that clear the acceptance floor the deepest entry
    /// wins, then the highest score. `None` is an ordinary outcome.
    pub fn find_best_match<S: AsRef<str>>(&self, categories: &[S]) -> Option<CategoryMatch<'_>> {
        let mut best: Option<CategoryMatch<'_>> = None;

        for raw in categories {
            let input = normalize(raw.as_ref());
            if input.is_empty() || self.stoplist.contains(&input) {
                continue;
            }

            let Some(candidate) = self.match_one(&input) else {
                continue;
            };
            if candidate.score <= ACCEPTANCE_FLOOR {
                continue;
            }

            let better = match &best {
                None => true,
                Some(current) => {
                    candidate.entry.depth > current.entry.depth
                        || (candidate.entry.depth == current.entry.depth
                            && candidate.score > current.score)
                }
            };
            if better {
                best = Some(candidate);
            }
        }

        best
    }

    /// Shorthand for [`find_best_match`](Self::find_best_match) folded into a classification.
    pub fn classify<S: AsRef<str>>(&self, categories: &[S]) -> Option<Classification> {
        self.find_best_match(categories)
            .map(|m| m.to_classification())
    }

    fn match_one(&self, input: &str) -> Option<CategoryMatch<'_>> {
        if let Some(entry) = self.index.lookup_exact(input) {
            return Some(CategoryMatch {
                entry,
                match_type: MatchType::Exact,
                score: 1.0,
            });
        }

        if let Some((entry, score)) = self.fuzzy(input) {
            return Some(CategoryMatch {
                entry,
                match_type: MatchType::Fuzzy,
                score,
            });
        }

        self.keyword(input).map(|(entry, score)| CategoryMatch {
            entry,
            match_type: MatchType::Keyword,
            score,
        })
    }

    fn fuzzy(&self, input: &str) -> Option<(&TaxonomyEntry, f64)> {
        let mut best: Option<(&TaxonomyEntry, f64)> = None;
        for (key, entry) in self.index.exact_keys() {
            let score = normalized_levenshtein(input, key);
            if score > FUZZY_THRESHOLD && outranks(entry, score, best) {
                best = Some((entry, score));
            }
        }
        best
    }

    fn keyword(&self, input: &str) -> Option<(&TaxonomyEntry, f64)> {
        let words: Vec<&str> = keywords(input).collect();
        if words.is_empty() {
            return None;
        }

        let mut hits: BTreeMap<usize, u32> = BTreeMap::new();
        for word in &words {
            for &pos in self.index.postings(word) {
                *hits.entry(pos).or_default() += 1;
            }
        }

        let mut best: Option<(&TaxonomyEntry, f64)> = None;
        for (pos, count) in hits {
            let Some(entry) = self.index.entry(pos) else {
                continue;
            };
            let score = count as f64 / words.len() as f64;
            if outranks(entry, score, best) {
                best = Some((entry, score));
            }
        }

        best.filter(|(_, score)| *score > ACCEPTANCE_FLOOR)
    }
}

/// Higher score wins; on a tie the deeper entry does, then the earlier one.
fn outranks(entry: &TaxonomyEntry, score: f64, best: Option<(&TaxonomyEntry, f64)>) -> bool {
    match best {
        None => true,
        Some((current, best_score)) => {
            score > best_score || (score == best_score && entry.depth > current.depth)
        }
    }
}
