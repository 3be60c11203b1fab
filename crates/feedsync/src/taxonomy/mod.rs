//! Taxonomy reference data.
//!
//! The taxonomy is a flat JSON array of entries, loaded once at start-up
//! and never mutated afterwards.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::TaxonomyError;

mod index;
pub mod normalize;

pub use index::CategoryIndex;
pub use normalize::normalize;

/// Separator between path segments (`Toys > Puzzles > 3D`).
pub const PATH_SEPARATOR: &str = " > ";

/// One category of the canonical taxonomy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxonomyEntry {
    pub key: u32,
    pub title: String,
    #[serde(default)]
    pub path: String,
    #[serde(default, alias = "pathDepth", alias = "path_depth")]
    pub depth: u32,
    #[serde(
        default,
        alias = "nomenclature_name",
        alias = "nomenclatureName",
        skip_serializing_if = "Option::is_none"
    )]
    pub alternate_name: Option<String>,
    #[serde(
        default,
        alias = "childrenCount",
        alias = "children_count",
        skip_serializing_if = "Option::is_none"
    )]
    pub child_count: Option<u32>,
}

impl TaxonomyEntry {
    pub fn new(key: u32, title: impl Into<String>, path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            key,
            title: title.into(),
            depth: path_depth(&path),
            path,
            alternate_name: None,
            child_count: None,
        }
    }

    pub fn with_alternate_name(mut self, name: impl Into<String>) -> Self {
        self.alternate_name = Some(name.into());
        self
    }

    pub fn with_child_count(mut self, count: u32) -> Self {
        self.child_count = Some(count);
        self
    }

    /// Entries without children are the only valid classification targets.
    pub fn is_leaf(&self) -> bool {
        self.child_count.unwrap_or(0) == 0
    }
}

fn path_depth(path: &str) -> u32 {
    if path.trim().is_empty() {
        0
    } else {
        path.split(PATH_SEPARATOR.trim()).count() as u32
    }
}

/// Loads the taxonomy from a JSON file.
pub fn load_taxonomy(path: &Path) -> Result<Vec<TaxonomyEntry>, TaxonomyError> {
    let raw = std::fs::read_to_string(path).map_err(|source| TaxonomyError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    let entries = parse_taxonomy(&raw)?;
    log::info!(
        "Loaded {} taxonomy entries from {}",
        entries.len(),
        path.display()
    );
    Ok(entries)
}

/// Parses and completes a taxonomy JSON document.
///
/// Missing paths default to the title, missing depths are derived from
/// the path, and missing child counts are derived from the other paths.
pub fn parse_taxonomy(raw: &str) -> Result<Vec<TaxonomyEntry>, TaxonomyError> {
    let mut entries: Vec<TaxonomyEntry> = serde_json::from_str(raw)?;
    if entries.is_empty() {
        return Err(TaxonomyError::Empty);
    }

    let mut seen = HashSet::with_capacity(entries.len());
    for entry in &mut entries {
        if !seen.insert(entry.key) {
            return Err(TaxonomyError::DuplicateKey(entry.key));
        }
        if entry.path.trim().is_empty() {
            entry.path = entry.title.clone();
        }
        if entry.depth == 0 {
            entry.depth = path_depth(&entry.path);
        }
    }

    derive_child_counts(&mut entries);
    Ok(entries)
}

fn derive_child_counts(entries: &mut [TaxonomyEntry]) {
    if entries.iter().all(|e| e.child_count.is_some()) {
        return;
    }

    let derived: Vec<u32> = entries
        .iter()
        .map(|parent| {
            let prefix = format!("{}{}", parent.path, PATH_SEPARATOR);
            entries
                .iter()
                .filter(|e| e.depth == parent.depth + 1 && e.path.starts_with(&prefix))
                .count() as u32
        })
        .collect();

    for (entry, count) in entries.iter_mut().zip(derived) {
        entry.child_count.get_or_insert(count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"[
        {"key": 1, "title": "Toys", "path": "Toys", "pathDepth": 1},
        {"key": 2, "title": "Puzzles", "path": "Toys > Puzzles", "nomenclature_name": "Puzzle"},
        {"key": 3, "title": "Books", "childrenCount": 0}
    ]"#;

    #[test]
    fn test_parse_completes_entries() {
        let entries = parse_taxonomy(SAMPLE).unwrap();
        assert_eq!(entries.len(), 3);

        assert_eq!(entries[0].depth, 1);
        assert_eq!(entries[0].child_count, Some(1));
        assert!(!entries[0].is_leaf());

        assert_eq!(entries[1].depth, 2);
        assert_eq!(entries[1].alternate_name.as_deref(), Some("Puzzle"));
        assert!(entries[1].is_leaf());

        assert_eq!(entries[2].path, "Books");
        assert_eq!(entries[2].depth, 1);
        assert!(entries[2].is_leaf());
    }

    #[test]
    fn test_parse_rejects_duplicates_and_empty() {
        let dup = r#"[{"key": 1, "title": "A"}, {"key": 1, "title": "B"}]"#;
        assert!(matches!(
            parse_taxonomy(dup),
            Err(TaxonomyError::DuplicateKey(1))
        ));
        assert!(matches!(parse_taxonomy("[]"), Err(TaxonomyError::Empty)));
        assert!(matches!(parse_taxonomy("{"), Err(TaxonomyError::Json(_))));
    }

    #[test]
    fn test_entry_builder() {
        let entry = TaxonomyEntry::new(5, "3D", "Toys > Puzzles > 3D").with_child_count(0);
        assert_eq!(entry.depth, 3);
        assert!(entry.is_leaf());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taxonomy.json");
        std::fs::write(&path, SAMPLE).unwrap();
        assert_eq!(load_taxonomy(&path).unwrap().len(), 3);

        let missing = dir.path().join("missing.json");
        assert!(matches!(
            load_taxonomy(&missing),
            Err(TaxonomyError::ReadFile { .. })
        ));
    }
}
