use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::job_repo::JobRow;
use crate::db::parse_timestamp;
use crate::error::JobError;

/// Prefix of categorize-job resource keys.
pub const CATEGORIZE_PREFIX: &str = "categorize:";
/// Resource key suffix of a categorize job spanning every feed.
pub const CATEGORIZE_ALL: &str = "all";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// Fetch a feed and upsert its products.
    Sync,
    /// Classify products that are not classified yet.
    Categorize,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Sync => "sync",
            JobKind::Categorize => "categorize",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sync" => Some(JobKind::Sync),
            "categorize" => Some(JobKind::Categorize),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Who asked for the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobOrigin {
    Scheduled,
    Manual,
}

impl JobOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOrigin::Scheduled => "scheduled",
            JobOrigin::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "manual" => JobOrigin::Manual,
            _ => JobOrigin::Scheduled,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub items_total: u64,
    pub items_processed: u64,
    pub items_failed: u64,
}

/// How far a resumable job got.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub total_chunks: u32,
    pub completed_chunks: u32,
    pub last_processed_offset: u64,
}

impl Checkpoint {
    pub fn start(total_chunks: u32) -> Self {
        Self {
            total_chunks,
            completed_chunks: 0,
            last_processed_offset: 0,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.completed_chunks >= self.total_chunks
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub resource_key: String,
    pub origin: JobOrigin,
    pub status: JobStatus,
    pub progress: JobProgress,
    pub checkpoint: Option<Checkpoint>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress_at: Option<DateTime<Utc>>,
}

impl Job {
    /// The feed this job works on, if it is tied to one.
    pub fn feed_id(&self) -> Option<&str> {
        match self.kind {
            JobKind::Sync => Some(self.resource_key.as_str()),
            JobKind::Categorize => match self.resource_key.strip_prefix(CATEGORIZE_PREFIX) {
                Some(CATEGORIZE_ALL) | None => None,
                Some(feed_id) => Some(feed_id),
            },
        }
    }

    /// Running with a recorded chunk plan. A fully checkpointed plan is
    /// resumable too: resuming it only completes the job.
    pub fn is_resumable(&self) -> bool {
        self.status == JobStatus::Running && self.checkpoint.is_some()
    }
}

/// Resource key of a sync job: the feed id.
pub fn sync_resource_key(feed_id: &str) -> String {
    feed_id.to_string()
}

/// Resource key of a categorize job.
pub fn categorize_resource_key(feed_id: Option<&str>) -> String {
    format!("{}{}", CATEGORIZE_PREFIX, feed_id.unwrap_or(CATEGORIZE_ALL))
}

fn time(value: Option<&str>) -> Option<DateTime<Utc>> {
    value.and_then(parse_timestamp)
}

impl TryFrom<JobRow> for Job {
    type Error = JobError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let invalid = |reason: String| JobError::InvalidRecord {
            job_id: row.id.clone(),
            reason,
        };
        let kind = JobKind::parse(&row.kind)
            .ok_or_else(|| invalid(format!("unknown kind '{}'", row.kind)))?;
        let status = JobStatus::parse(&row.status)
            .ok_or_else(|| invalid(format!("unknown status '{}'", row.status)))?;
        let created_at = parse_timestamp(&row.created_at)
            .ok_or_else(|| invalid(format!("bad created_at '{}'", row.created_at)))?;

        let checkpoint = match (row.total_chunks, row.completed_chunks) {
            (Some(total), Some(completed)) => Some(Checkpoint {
                total_chunks: total.max(0) as u32,
                completed_chunks: completed.max(0) as u32,
                last_processed_offset: row.last_processed_offset.unwrap_or(0).max(0) as u64,
            }),
            _ => None,
        };

        Ok(Job {
            kind,
            status,
            origin: JobOrigin::parse(&row.origin),
            progress: JobProgress {
                items_total: row.items_total.max(0) as u64,
                items_processed: row.items_processed.max(0) as u64,
                items_failed: row.items_failed.max(0) as u64,
            },
            checkpoint,
            created_at,
            started_at: time(row.started_at.as_deref()),
            completed_at: time(row.completed_at.as_deref()),
            progress_at: time(row.progress_at.as_deref()),
            error: row.error,
            resource_key: row.resource_key,
            id: row.id,
        })
    }
}
