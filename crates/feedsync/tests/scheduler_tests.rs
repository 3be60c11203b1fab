//! Scheduler entry points and the interval trigger.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use common::{product, products, TestEnv};
use feedsync::db::{feed_repo, format_timestamp};
use feedsync::feed::ProductStore;
use feedsync::jobs::{sync_resource_key, JobKind, JobOrigin, JobStatus};
use feedsync::scheduler::{ScheduleTrigger, TriggerIntervals};
use feedsync::{FeedsyncError, JobError, QueueError};

#[tokio::test]
async fn test_only_due_feeds_are_scheduled() {
    let env = TestEnv::new();
    let scheduler = &env.services.scheduler;

    let due = env.add_feed(products("a", 1));
    let paused = env.add_feed(products("b", 1));
    feed_repo::set_paused(&env.db, &paused.id, true).unwrap();
    let fresh = env.add_feed(products("c", 1));
    feed_repo::set_last_sync(&env.db, &fresh.id, &format_timestamp(Utc::now())).unwrap();
    let busy = env.add_feed(products("d", 1));
    env.services
        .queue
        .schedule(JobKind::Sync, &sync_resource_key(&busy.id), JobOrigin::Manual)
        .unwrap();

    let scheduled = scheduler.sync_due_feeds().unwrap();
    assert_eq!(scheduled.len(), 1);
    let job = env.ledger().require(&scheduled[0]).unwrap();
    assert_eq!(job.resource_key, sync_resource_key(&due.id));
    assert_eq!(job.origin, JobOrigin::Scheduled);
    assert_eq!(env.ledger().count(JobStatus::Pending).unwrap(), 2);

    // Nothing new while the job is still pending.
    assert!(scheduler.sync_due_feeds().unwrap().is_empty());
}

#[tokio::test]
async fn test_manual_sync_rejected_while_active() {
    let env = TestEnv::gated();
    let scheduler = &env.services.scheduler;
    let feed = env.add_feed(products("p", 4));

    let id = scheduler.trigger_manual_sync(&feed.id).unwrap();
    assert_eq!(env.ledger().status(&id).unwrap(), JobStatus::Running);

    let err = scheduler.trigger_manual_sync(&feed.id).unwrap_err();
    assert!(matches!(
        err,
        FeedsyncError::Queue(QueueError::AlreadyRunning { .. })
    ));

    env.fetcher.open_gate(2);
    env.services.queue.wait_idle().await;
    assert_eq!(env.ledger().status(&id).unwrap(), JobStatus::Completed);

    let again = scheduler.trigger_manual_sync(&feed.id).unwrap();
    env.services.queue.wait_idle().await;
    assert_eq!(env.ledger().require(&again).unwrap().origin, JobOrigin::Manual);
}

#[tokio::test]
async fn test_manual_sync_of_unknown_feed() {
    let env = TestEnv::new();
    let err = env
        .services
        .scheduler
        .trigger_manual_sync("no-such-feed")
        .unwrap_err();
    assert!(matches!(
        err,
        FeedsyncError::Job(JobError::FeedNotFound(id)) if id == "no-such-feed"
    ));
}

#[tokio::test]
async fn test_categorization_needs_unprocessed_products() {
    let env = TestEnv::new();
    let scheduler = &env.services.scheduler;
    let feed = env.add_feed(Vec::new());

    assert_eq!(scheduler.schedule_categorization(Some(&feed.id)).await.unwrap(), None);

    env.store
        .upsert(&feed.id, &product("A", "Jigsaw", &["Puzzle"]))
        .await
        .unwrap();
    let id = scheduler
        .schedule_categorization(Some(&feed.id))
        .await
        .unwrap()
        .expect("a categorize job");
    // Already pending.
    assert_eq!(scheduler.schedule_categorization(Some(&feed.id)).await.unwrap(), None);

    scheduler.process_queue().unwrap();
    env.services.queue.wait_idle().await;
    assert_eq!(env.ledger().status(&id).unwrap(), JobStatus::Completed);
    assert_eq!(scheduler.schedule_categorization(Some(&feed.id)).await.unwrap(), None);
}

#[tokio::test]
async fn test_tick_syncs_then_categorizes() {
    let env = TestEnv::new();
    let scheduler = &env.services.scheduler;
    let feed = env.add_feed(vec![
        product("A", "Jigsaw", &["Puzzle"]),
        product("B", "Race car", &["Mașinuțe"]),
    ]);

    let first = scheduler.tick().await.unwrap();
    assert_eq!(first.scheduled_syncs.len(), 1);
    assert!(first.scheduled_categorizations.is_empty());
    assert_eq!(first.started, first.scheduled_syncs);
    env.services.queue.wait_idle().await;

    let second = scheduler.tick().await.unwrap();
    assert!(second.scheduled_syncs.is_empty(), "feed was just synced");
    assert_eq!(second.scheduled_categorizations.len(), 1);
    env.services.queue.wait_idle().await;

    let stats = env.store.processing_stats(Some(&feed.id)).await.unwrap();
    assert_eq!((stats.total, stats.processed), (2, 2));
    assert_eq!(env.notifier.events().len(), 2);
}

#[tokio::test]
async fn test_trigger_stops_promptly() {
    let env = TestEnv::new();
    env.add_feed(products("p", 2));

    let intervals = TriggerIntervals {
        queue: Duration::from_secs(3600),
        feeds: Duration::from_secs(3600),
        categorize: Duration::from_secs(3600),
        reaper: Duration::from_secs(3600),
    };
    let trigger = Arc::new(ScheduleTrigger::new(
        Arc::clone(&env.services.scheduler),
        intervals,
    ));

    let running = Arc::clone(&trigger);
    let handle = tokio::spawn(async move { running.run().await });

    // The first tick of every interval fires at once.
    tokio::time::sleep(Duration::from_millis(50)).await;
    trigger.stop();

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("trigger did not stop")
        .unwrap();

    env.services.queue.wait_idle().await;
    let synced = env
        .ledger()
        .recent(10)
        .unwrap()
        .into_iter()
        .any(|job| job.kind == JobKind::Sync && job.status == JobStatus::Completed);
    assert!(synced);
}
