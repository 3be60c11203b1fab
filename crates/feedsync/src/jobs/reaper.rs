//! Recovery of jobs left `running` by a crashed or stuck worker.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;

use super::queue::JobQueue;
use crate::error::JobError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReapReport {
    /// Jobs handed back to the queue for resumption.
    pub resumed: Vec<String>,
    /// Jobs moved to `failed`.
    pub failed: Vec<String>,
    pub purged_snapshots: usize,
}

pub struct StallReaper {
    queue: Arc<JobQueue>,
}

impl StallReaper {
    pub fn new(queue: Arc<JobQueue>) -> Self {
        Self { queue }
    }

    /// Resumes or fails every running job without progress for more than
    /// `max_age_minutes`, then purges expired snapshots.
    ///
    /// A job with a checkpointed plan is resumed (one whose chunks are all
    /// checkpointed is only completed). If the resume cannot start, or the
    /// resumed run fails later, the job is failed with the reason. Jobs
    /// without a checkpoint are failed directly. Either way the resource is
    /// free for new admissions afterwards.
    pub fn cleanup_stalled(&self, max_age_minutes: i64) -> Result<ReapReport, JobError> {
        let _span = tracing::info_span!("reaper", max_age_minutes).entered();
        let ledger = self.queue.ledger();
        let cutoff = Utc::now() - Duration::minutes(max_age_minutes);
        let mut report = ReapReport::default();

        for job in ledger.stalled(cutoff)? {
            if job.is_resumable() {
                match self.queue.recover(&job.id) {
                    Ok(()) => {
                        log::info!("Resumed stalled job {}", job.id);
                        report.resumed.push(job.id);
                    }
                    Err(e) => {
                        let message = JobError::StallResumeFailed(Box::new(e)).to_string();
                        if ledger.fail(&job.id, &message)? {
                            report.failed.push(job.id);
                        }
                    }
                }
            } else {
                let message = JobError::StallTimeout {
                    minutes: max_age_minutes,
                }
                .to_string();
                if ledger.fail(&job.id, &message)? {
                    report.failed.push(job.id);
                }
            }
        }

        report.purged_snapshots = ledger.purge_expired_snapshots()?;

        if !report.resumed.is_empty() || !report.failed.is_empty() {
            log::info!(
                "Stall reaper: {} resumed, {} failed",
                report.resumed.len(),
                report.failed.len()
            );
        }
        if report.purged_snapshots > 0 {
            log::debug!("Purged {} expired snapshots", report.purged_snapshots);
        }
        Ok(report)
    }
}
