//! Text normalization shared by index building and matching.

use deunicode::deunicode;
use regex::Regex;
use std::sync::LazyLock;

static RE_NON_ALNUM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9\s]").expect("Invalid regex"));

static RE_WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("Invalid regex"));

/// Minimum length (exclusive) for a word to take part in keyword matching.
pub const MIN_KEYWORD_LEN: usize = 2;

/// Normalizes free text for lookup.
///
/// 1. Transliterate to ASCII (strips diacritics: `Jucării` -> `Jucarii`)
/// 2. Lowercase
/// 3. Replace everything outside `[a-z0-9]` and whitespace with a space
/// 4. Collapse whitespace runs and trim
pub fn normalize(text: &str) -> String {
    let latin = deunicode(text).to_lowercase();
    let cleaned = RE_NON_ALNUM.replace_all(&latin, " ");
    RE_WHITESPACE.replace_all(&cleaned, " ").trim().to_string()
}

/// Words of an already normalized string that are long enough to index.
pub fn keywords(normalized: &str) -> impl Iterator<Item = &str> {
    normalized
        .split(' ')
        .filter(|word| word.len() > MIN_KEYWORD_LEN)
}
