use std::path::PathBuf;

use thiserror::Error;

/// Failures below the repository layer.
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The store directory could not be created.
    #[error("cannot prepare store directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("schema upgrade to v{version} failed: {reason}")]
    Migration { version: u32, reason: String },

    /// A serialized column (categories, snapshot items, event lists) did
    /// not round-trip.
    #[error("column {column} holds malformed JSON: {source}")]
    Json {
        column: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("store connection lock poisoned")]
    LockPoisoned,
}
