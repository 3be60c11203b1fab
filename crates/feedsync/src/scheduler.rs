//! Scheduler trigger: the periodic entry points that schedule feed syncs
//! and categorization, run admission and reap stalled jobs.
//!
//! [`Scheduler`] exposes each operation once; [`ScheduleTrigger`] calls
//! them on independent tokio intervals until stopped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;

use crate::db::feed_repo;
use crate::error::{JobError, QueueError, Result};
use crate::feed::ProductStore;
use crate::jobs::{
    categorize_resource_key, sync_resource_key, JobKind, JobOrigin, JobQueue, ReapReport,
    StallReaper,
};

/// What one full scheduler pass did.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickReport {
    pub scheduled_syncs: Vec<String>,
    pub scheduled_categorizations: Vec<String>,
    pub started: Vec<String>,
    pub reaped: ReapReport,
}

pub struct Scheduler {
    queue: Arc<JobQueue>,
    store: Arc<dyn ProductStore>,
    reaper: StallReaper,
    stall_minutes: i64,
}

impl Scheduler {
    pub fn new(queue: Arc<JobQueue>, store: Arc<dyn ProductStore>, stall_minutes: i64) -> Self {
        Self {
            reaper: StallReaper::new(Arc::clone(&queue)),
            queue,
            store,
            stall_minutes,
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Schedules a sync for every active, unpaused feed whose interval has
    /// elapsed and which has no pending or running job. Returns job ids.
    pub fn sync_due_feeds(&self) -> Result<Vec<String>> {
        let ledger = self.queue.ledger();
        let now = Utc::now();
        let mut scheduled = Vec::new();

        for feed in feed_repo::list_schedulable(ledger.database())? {
            if !feed.is_due(now) {
                continue;
            }
            let key = sync_resource_key(&feed.id);
            if ledger.has_active(&key)? {
                log::debug!("Feed {} already has an active sync", feed.id);
                continue;
            }
            match self.queue.schedule(JobKind::Sync, &key, JobOrigin::Scheduled) {
                Ok(id) => scheduled.push(id),
                // Started by someone else between the check and the insert.
                Err(QueueError::AlreadyRunning { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        if !scheduled.is_empty() {
            log::info!("Scheduled {} feed syncs", scheduled.len());
        }
        Ok(scheduled)
    }

    /// Schedules a sync requested by a user and runs admission right away.
    ///
    /// Rejected while the feed has a pending or running job.
    pub fn trigger_manual_sync(&self, feed_id: &str) -> Result<String> {
        let ledger = self.queue.ledger();
        if feed_repo::find_by_id(ledger.database(), feed_id)?.is_none() {
            return Err(JobError::FeedNotFound(feed_id.to_string()).into());
        }

        let key = sync_resource_key(feed_id);
        if ledger.has_active(&key)? {
            return Err(QueueError::AlreadyRunning { resource_key: key }.into());
        }

        let id = self.queue.schedule(JobKind::Sync, &key, JobOrigin::Manual)?;
        log::info!("Manual sync of feed {} queued as job {}", feed_id, id);
        self.queue.process_queue()?;
        Ok(id)
    }

    /// Schedules categorization of one feed (or all feeds) when there is
    /// something left to classify. Returns `None` when nothing was queued.
    pub async fn schedule_categorization(&self, feed_id: Option<&str>) -> Result<Option<String>> {
        let key = categorize_resource_key(feed_id);
        if self.queue.ledger().has_active(&key)? {
            log::debug!("Categorization for '{}' already active", key);
            return Ok(None);
        }

        let stats = self.store.processing_stats(feed_id).await?;
        if stats.unprocessed == 0 {
            return Ok(None);
        }

        match self
            .queue
            .schedule(JobKind::Categorize, &key, JobOrigin::Scheduled)
        {
            Ok(id) => {
                log::info!(
                    "Scheduled categorization of {} products for '{}'",
                    stats.unprocessed,
                    key
                );
                Ok(Some(id))
            }
            Err(QueueError::AlreadyRunning { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Categorization pass over every schedulable feed.
    pub async fn categorize_feeds(&self) -> Result<Vec<String>> {
        let feeds = feed_repo::list_schedulable(self.queue.ledger().database())?;
        let mut scheduled = Vec::new();
        for feed in feeds {
            if let Some(id) = self.schedule_categorization(Some(&feed.id)).await? {
                scheduled.push(id);
            }
        }
        Ok(scheduled)
    }

    pub fn process_queue(&self) -> Result<Vec<String>> {
        Ok(self.queue.process_queue()?)
    }

    pub fn reap(&self) -> Result<ReapReport> {
        Ok(self.reaper.cleanup_stalled(self.stall_minutes)?)
    }

    /// Runs every periodic operation once.
    pub async fn tick(&self) -> Result<TickReport> {
        let reaped = self.reap()?;
        let scheduled_syncs = self.sync_due_feeds()?;
        let scheduled_categorizations = self.categorize_feeds().await?;
        let started = self.process_queue()?;
        Ok(TickReport {
            scheduled_syncs,
            scheduled_categorizations,
            started,
            reaped,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TriggerIntervals {
    pub queue: Duration,
    pub feeds: Duration,
    pub categorize: Duration,
    pub reaper: Duration,
}

impl Default for TriggerIntervals {
    fn default() -> Self {
        Self {
            queue: Duration::from_secs(120),
            feeds: Duration::from_secs(300),
            categorize: Duration::from_secs(300),
            reaper: Duration::from_secs(600),
        }
    }
}

fn interval(period: Duration) -> tokio::time::Interval {
    let mut timer = tokio::time::interval(period.max(Duration::from_millis(1)));
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

/// Drives a [`Scheduler`] on fixed intervals.
pub struct ScheduleTrigger {
    scheduler: Arc<Scheduler>,
    intervals: TriggerIntervals,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl ScheduleTrigger {
    pub fn new(scheduler: Arc<Scheduler>, intervals: TriggerIntervals) -> Self {
        Self {
            scheduler,
            intervals,
            shutdown: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Runs until [`stop`](Self::stop) is called. The first tick of every
    /// interval fires immediately.
    pub async fn run(&self) {
        let mut queue_timer = interval(self.intervals.queue);
        let mut feeds_timer = interval(self.intervals.feeds);
        let mut categorize_timer = interval(self.intervals.categorize);
        let mut reaper_timer = interval(self.intervals.reaper);
        let scheduler = &self.scheduler;

        log::info!("Scheduler trigger started");
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            tokio::select! {
                _ = reaper_timer.tick() => {
                    if let Err(e) = scheduler.reap() {
                        log::error!("Stall reaper failed: {}", e);
                    }
                }
                _ = feeds_timer.tick() => {
                    match scheduler.sync_due_feeds() {
                        Ok(ids) if !ids.is_empty() => {
                            if let Err(e) = scheduler.process_queue() {
                                log::error!("Admission failed: {}", e);
                            }
                        }
                        Ok(_) => {}
                        Err(e) => log::error!("Feed scheduling failed: {}", e),
                    }
                }
                _ = categorize_timer.tick() => {
                    match scheduler.categorize_feeds().await {
                        Ok(ids) if !ids.is_empty() => {
                            if let Err(e) = scheduler.process_queue() {
                                log::error!("Admission failed: {}", e);
                            }
                        }
                        Ok(_) => {}
                        Err(e) => log::error!("Categorization scheduling failed: {}", e),
                    }
                }
                _ = queue_timer.tick() => {
                    if let Err(e) = scheduler.process_queue() {
                        log::error!("Admission failed: {}", e);
                    }
                }
                _ = self.wake.notified() => {}
            }
        }
        log::info!("Scheduler trigger stopped");
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake.notify_one();
    }
}
