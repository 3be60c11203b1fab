use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::normalize::{keywords, normalize};
use super::TaxonomyEntry;
use crate::error::TaxonomyError;

/// Read-only lookup structure over the taxonomy.
///
/// Built once (possibly offline, see [`CategoryIndex::save`]) and shared
/// between matchers without locking. Entries are referenced by position
/// in `entries`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryIndex {
    entries: Vec<TaxonomyEntry>,
    exact: BTreeMap<String, usize>,
    keywords: BTreeMap<String, Vec<usize>>,
    built_at: DateTime<Utc>,
    #[serde(skip)]
    by_key: HashMap<u32, usize>,
}

impl CategoryIndex {
    /// Indexes the normalized title and alternate name of every entry.
    ///
    /// When two entries normalize to the same text the more specific
    /// (deeper) one keeps the exact slot; on equal depth the first wins.
    pub fn build(entries: Vec<TaxonomyEntry>) -> Self {
        let mut exact: BTreeMap<String, usize> = BTreeMap::new();
        let mut postings: BTreeMap<String, Vec<usize>> = BTreeMap::new();

        for (pos, entry) in entries.iter().enumerate() {
            let names = std::iter::once(entry.title.as_str()).chain(entry.alternate_name.as_deref());
            for name in names {
                let normalized = normalize(name);
                if normalized.is_empty() {
                    continue;
                }

                for word in keywords(&normalized) {
                    let list = postings.entry(word.to_string()).or_default();
                    if list.last() != Some(&pos) {
                        list.push(pos);
                    }
                }

                match exact.get(&normalized) {
                    Some(&existing) if entries[existing].depth >= entry.depth => {}
                    _ => {
                        exact.insert(normalized, pos);
                    }
                }
            }
        }

        let mut index = Self {
            entries,
            exact,
            keywords: postings,
            built_at: Utc::now(),
            by_key: HashMap::new(),
        };
        index.rebuild_key_map();
        log::debug!(
            "Category index built: {} entries, {} exact keys, {} keywords",
            index.entries.len(),
            index.exact.len(),
            index.keywords.len()
        );
        index
    }

    fn rebuild_key_map(&mut self) {
        self.by_key = self
            .entries
            .iter()
            .enumerate()
            .map(|(pos, e)| (e.key, pos))
            .collect();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    pub fn entries(&self) -> &[TaxonomyEntry] {
        &self.entries
    }

    pub fn entry(&self, pos: usize) -> Option<&TaxonomyEntry> {
        self.entries.get(pos)
    }

    pub fn get(&self, key: u32) -> Option<&TaxonomyEntry> {
        self.by_key.get(&key).map(|&pos| &self.entries[pos])
    }

    /// Leaf entries, in taxonomy order.
    pub fn leaves(&self) -> impl Iterator<Item = &TaxonomyEntry> {
        self.entries.iter().filter(|e| e.is_leaf())
    }

    /// Exact lookup of an already normalized string.
    pub fn lookup_exact(&self, normalized: &str) -> Option<&TaxonomyEntry> {
        self.exact.get(normalized).map(|&pos| &self.entries[pos])
    }

    /// All exact keys with their entries, in key order.
    pub fn exact_keys(&self) -> impl Iterator<Item = (&str, &TaxonomyEntry)> {
        self.exact
            .iter()
            .map(|(key, &pos)| (key.as_str(), &self.entries[pos]))
    }

    /// Positions of the entries whose names contain `word`.
    pub fn postings(&self, word: &str) -> &[usize] {
        self.keywords.get(word).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn keyword_count(&self) -> usize {
        self.keywords.len()
    }

    /// Ranks entries by how many of `words` hit them, best first, keeping
    /// those accepted by `filter`. Ties keep taxonomy order.
    pub fn rank_by_keywords<'a, F>(
        &self,
        words: impl IntoIterator<Item = &'a str>,
        limit: usize,
        filter: F,
    ) -> Vec<&TaxonomyEntry>
    where
        F: Fn(&TaxonomyEntry) -> bool,
    {
        let mut hits: BTreeMap<usize, u32> = BTreeMap::new();
        for word in words {
            for &pos in self.postings(word) {
                *hits.entry(pos).or_default() += 1;
            }
        }

        let mut ranked: Vec<(usize, u32)> = hits
            .into_iter()
            .filter(|(pos, _)| filter(&self.entries[*pos]))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked
            .into_iter()
            .take(limit)
            .map(|(pos, _)| &self.entries[pos])
            .collect()
    }

    /// Writes the index as JSON so it can be prepared ahead of time.
    pub fn save(&self, path: &Path) -> Result<(), TaxonomyError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| TaxonomyError::WriteFile {
                    path: path.to_path_buf(),
                    source,
                })?;
            }
        }
        let json = serde_json::to_string(self)?;
        std::fs::write(path, json).map_err(|source| TaxonomyError::WriteFile {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads a previously saved index.
    pub fn load(path: &Path) -> Result<Self, TaxonomyError> {
        let raw = std::fs::read_to_string(path).map_err(|source| TaxonomyError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        let mut index: Self = serde_json::from_str(&raw)?;
        if index.entries.is_empty() {
            return Err(TaxonomyError::Empty);
        }
        index.rebuild_key_map();
        log::info!(
            "Loaded prebuilt category index from {} ({} entries, built {})",
            path.display(),
            index.entries.len(),
            index.built_at
        );
        Ok(index)
    }
}
