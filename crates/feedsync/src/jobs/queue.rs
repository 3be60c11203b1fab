//! Admission control: starts pending jobs under a global concurrency
//! ceiling and one running job per resource.
//!
//! Correctness rests on the ledger, not on this struct: the running-job
//! uniqueness and the ceiling are part of the `pending -> running`
//! statement itself. The in-flight set only keeps this process from
//! spawning the same job twice.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;

use super::ledger::JobLedger;
use super::model::{Job, JobKind, JobOrigin, JobStatus};
use super::processor::{BatchProcessor, ExecutionOutcome};
use crate::db::DatabaseError;
use crate::error::{JobError, QueueError};

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub max_concurrent_jobs: usize,
    /// Pending jobs inspected per admission pass.
    pub pending_scan_limit: u64,
    /// Pause before a finished job's slot is offered to the next one.
    pub readmit_delay: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 5,
            pending_scan_limit: 50,
            readmit_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub active: u64,
    pub pending: u64,
    pub max_concurrent: usize,
    pub in_flight: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Launch {
    Start,
    Resume,
    /// Resume on behalf of the stall reaper.
    Recover,
}

pub struct JobQueue {
    ledger: JobLedger,
    processor: Arc<BatchProcessor>,
    settings: QueueSettings,
    in_flight: Mutex<HashSet<String>>,
    idle: Notify,
}

impl JobQueue {
    pub fn new(processor: Arc<BatchProcessor>, settings: QueueSettings) -> Arc<Self> {
        Arc::new(Self {
            ledger: processor.ledger().clone(),
            processor,
            settings,
            in_flight: Mutex::new(HashSet::new()),
            idle: Notify::new(),
        })
    }

    pub fn ledger(&self) -> &JobLedger {
        &self.ledger
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Records a pending job for `resource_key`. Returns its id.
    pub fn schedule(
        &self,
        kind: JobKind,
        resource_key: &str,
        origin: JobOrigin,
    ) -> Result<String, QueueError> {
        Ok(self.ledger.schedule(kind, resource_key, origin)?.id)
    }

    /// One admission pass. Returns the ids of the jobs started.
    ///
    /// Safe to call at any time and from several tasks at once; a job
    /// that loses the start race is simply skipped.
    pub fn process_queue(self: &Arc<Self>) -> Result<Vec<String>, QueueError> {
        let ceiling = self.settings.max_concurrent_jobs.max(1);
        let running = self.ledger.count(JobStatus::Running)? as usize;
        if running >= ceiling {
            log::debug!("Queue at capacity ({}/{}), deferring", running, ceiling);
            return Ok(Vec::new());
        }

        let slots = ceiling - running;
        let pending = self.ledger.pending(self.settings.pending_scan_limit)?;
        let mut claimed: HashSet<String> = HashSet::new();
        let mut started = Vec::new();

        for job in pending {
            if started.len() >= slots {
                break;
            }
            if self.is_in_flight(&job.id) || !claimed.insert(job.resource_key.clone()) {
                continue;
            }
            if self.ledger.has_running(&job.resource_key)? {
                log::debug!(
                    "Skipping job {}: resource '{}' is busy",
                    job.id,
                    job.resource_key
                );
                continue;
            }
            if !self.ledger.try_start(&job.id, ceiling)? {
                log::debug!("Job {} was not started (claimed elsewhere or at capacity)", job.id);
                continue;
            }

            log::info!(
                "Starting {} job {} for '{}'",
                job.kind.as_str(),
                job.id,
                job.resource_key
            );
            started.push(job.id.clone());
            self.spawn(job, Launch::Start);
        }

        Ok(started)
    }

    /// Continues a running job from its checkpoint in the background.
    pub fn resume(self: &Arc<Self>, job_id: &str) -> Result<(), JobError> {
        self.relaunch(job_id, Launch::Resume)
    }

    /// Like [`resume`](Self::resume), for a job found stalled: a later
    /// failure of the resumed run is recorded as a failed stall recovery.
    pub fn recover(self: &Arc<Self>, job_id: &str) -> Result<(), JobError> {
        self.relaunch(job_id, Launch::Recover)
    }

    fn relaunch(self: &Arc<Self>, job_id: &str, launch: Launch) -> Result<(), JobError> {
        if self.is_in_flight(job_id) {
            return Err(JobError::InFlight(job_id.to_string()));
        }
        let job = self.ledger.require(job_id)?;
        self.processor.preflight(&job)?;
        self.ledger.touch(job_id)?;

        log::info!("Resuming job {}", job_id);
        self.spawn(job, launch);
        Ok(())
    }

    pub fn status(&self) -> Result<QueueStatus, DatabaseError> {
        Ok(QueueStatus {
            active: self.ledger.count(JobStatus::Running)?,
            pending: self.ledger.count(JobStatus::Pending)?,
            max_concurrent: self.settings.max_concurrent_jobs,
            in_flight: self.in_flight_count(),
        })
    }

    pub fn is_in_flight(&self, job_id: &str) -> bool {
        self.in_flight
            .lock()
            .map(|set| set.contains(job_id))
            .unwrap_or(false)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().map(|set| set.len()).unwrap_or(0)
    }

    /// Waits until no job spawned by this queue is executing.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight_count() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn spawn(self: &Arc<Self>, job: Job, launch: Launch) {
        if let Ok(mut set) = self.in_flight.lock() {
            set.insert(job.id.clone());
        }

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = match launch {
                Launch::Start => queue.processor.execute(&job).await,
                Launch::Resume => queue.processor.resume(&job).await,
                Launch::Recover => queue.processor.recover(&job).await,
            };
            match &outcome {
                ExecutionOutcome::Completed(_) => {}
                ExecutionOutcome::Yielded(checkpoint) => log::info!(
                    "Job {} yielded at chunk {}/{}",
                    job.id,
                    checkpoint.completed_chunks,
                    checkpoint.total_chunks
                ),
                ExecutionOutcome::Halted => log::info!("Job {} halted", job.id),
                ExecutionOutcome::Failed(error) => log::error!("Job {} failed: {}", job.id, error),
            }

            // Offer the freed slot before leaving the in-flight set, so
            // `wait_idle` only returns once nothing else was admitted.
            if !queue.settings.readmit_delay.is_zero() {
                tokio::time::sleep(queue.settings.readmit_delay).await;
            }
            if let Err(e) = queue.process_queue() {
                log::error!("Re-admission after job {} failed: {}", job.id, e);
            }
            queue.release(&job.id);
        });
    }

    fn release(&self, job_id: &str) {
        let empty = match self.in_flight.lock() {
            Ok(mut set) => {
                set.remove(job_id);
                set.is_empty()
            }
            Err(_) => true,
        };
        if empty {
            self.idle.notify_waiters();
        }
    }
}
