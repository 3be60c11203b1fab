use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FeedsyncError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Taxonomy error: {0}")]
    Taxonomy(#[from] TaxonomyError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Oracle error: {0}")]
    Oracle(#[from] OracleError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Secret error: {0}")]
    Secret(#[from] crate::secrets::SecretError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },
}

#[derive(Error, Debug)]
pub enum TaxonomyError {
    #[error("Failed to read taxonomy file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write index file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to decode taxonomy JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Taxonomy is empty")]
    Empty,

    #[error("Duplicate taxonomy key {0}")]
    DuplicateKey(u32),
}

/// Network or HTTP failure reaching a source feed.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Request to '{url}' failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Feed '{url}' answered with HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("Feed has no URL configured")]
    MissingUrl,
}

/// Malformed feed content.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Malformed XML at byte {position}: {message}")]
    Xml { position: u64, message: String },

    #[error("Unrecognized feed layout (root element '{0}')")]
    UnknownLayout(String),

    #[error("Feed body is not valid UTF-8")]
    Encoding,
}

/// Product store failures. `Unavailable` means the store itself cannot be
/// reached and aborts the whole chunk; `Rejected` only affects one item.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Product store unavailable: {0}")]
    Unavailable(String),

    #[error("Product '{id}' rejected: {reason}")]
    Rejected { id: String, reason: String },
}

impl StoreError {
    pub fn is_chunk_level(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }

    /// Attaches the product id to an item-level rejection.
    pub fn for_product(self, product_id: &str) -> Self {
        match self {
            StoreError::Rejected { reason, .. } => StoreError::Rejected {
                id: product_id.to_string(),
                reason,
            },
            other => other,
        }
    }
}

impl From<crate::db::DatabaseError> for StoreError {
    fn from(e: crate::db::DatabaseError) -> Self {
        use crate::db::DatabaseError;
        match e {
            DatabaseError::Sqlite(rusqlite::Error::SqliteFailure(code, msg))
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Rejected {
                    id: String::new(),
                    reason: msg.unwrap_or_else(|| "constraint violation".to_string()),
                }
            }
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

/// Classification oracle call failed or returned unusable output.
#[derive(Error, Debug)]
pub enum OracleError {
    #[error("Oracle request failed: {0}")]
    Transport(String),

    #[error("Oracle answered with HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Oracle returned an empty reply")]
    EmptyReply,

    #[error("Failed to parse oracle reply: {0}")]
    ResponseParse(String),

    #[error("Oracle is not configured")]
    NotConfigured,
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("A job is already running for resource '{resource_key}'")]
    AlreadyRunning { resource_key: String },

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Job {0} not found")]
    NotFound(String),

    #[error("Feed {0} not found")]
    FeedNotFound(String),

    #[error("Cannot resume job {0}: work set snapshot not found")]
    SnapshotMissing(String),

    #[error("Job {job_id} has no checkpoint to resume from")]
    NoCheckpoint { job_id: String },

    #[error("Job stalled for more than {minutes} minutes and was automatically failed")]
    StallTimeout { minutes: i64 },

    #[error("Job {job_id} is no longer running")]
    Cancelled { job_id: String },

    #[error("Job {0} is still executing in this process")]
    InFlight(String),

    #[error("Job {job_id} has an invalid record: {reason}")]
    InvalidRecord { job_id: String, reason: String },

    #[error("Job stalled and resume failed: {0}")]
    StallResumeFailed(Box<JobError>),

    #[error("Invalid work set snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Database(#[from] crate::db::DatabaseError),
}

pub type Result<T> = std::result::Result<T, FeedsyncError>;
