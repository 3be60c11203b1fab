//! Admission control: the global ceiling, FIFO order, and one running job
//! per resource under concurrent scheduling and admission.

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::future::join_all;

use common::{products, TestEnv};
use feedsync::jobs::{sync_resource_key, JobKind, JobLedger, JobOrigin, JobStatus};
use feedsync::QueueError;

#[tokio::test]
async fn test_ceiling_admits_oldest_five() {
    let env = TestEnv::gated();
    let queue = &env.services.queue;

    let mut scheduled = Vec::new();
    for _ in 0..7 {
        let feed = env.add_feed(products("p", 3));
        let id = queue
            .schedule(JobKind::Sync, &sync_resource_key(&feed.id), JobOrigin::Scheduled)
            .unwrap();
        scheduled.push(id);
    }

    let started = queue.process_queue().unwrap();
    assert_eq!(started, scheduled[..5].to_vec());

    let status = queue.status().unwrap();
    assert_eq!(status.active, 5);
    assert_eq!(status.pending, 2);
    assert_eq!(status.in_flight, 5);

    // A second pass while at capacity starts nothing.
    assert!(queue.process_queue().unwrap().is_empty());

    env.fetcher.open_gate(7);
    queue.wait_idle().await;

    for id in &scheduled {
        let job = env.ledger().require(id).unwrap();
        assert_eq!(job.status, JobStatus::Completed, "job {}", id);
        assert_eq!(job.progress.items_processed, 3);
    }
    assert_eq!(env.ledger().count(JobStatus::Running).unwrap(), 0);
}

#[tokio::test]
async fn test_schedule_rejected_while_resource_running() {
    let env = TestEnv::gated();
    let queue = &env.services.queue;
    let feed = env.add_feed(products("p", 1));
    let key = sync_resource_key(&feed.id);

    queue
        .schedule(JobKind::Sync, &key, JobOrigin::Scheduled)
        .unwrap();
    assert_eq!(queue.process_queue().unwrap().len(), 1);

    let err = queue
        .schedule(JobKind::Sync, &key, JobOrigin::Manual)
        .unwrap_err();
    assert!(matches!(err, QueueError::AlreadyRunning { resource_key } if resource_key == key));

    env.fetcher.open_gate(1);
    queue.wait_idle().await;

    // Free again once the job is terminal.
    assert!(queue.schedule(JobKind::Sync, &key, JobOrigin::Manual).is_ok());
}

#[tokio::test]
async fn test_second_pending_job_waits_for_resource() {
    let env = TestEnv::gated();
    let queue = &env.services.queue;
    let feed = env.add_feed(products("p", 2));
    let key = sync_resource_key(&feed.id);

    let first = queue.schedule(JobKind::Sync, &key, JobOrigin::Scheduled).unwrap();
    let second = queue.schedule(JobKind::Sync, &key, JobOrigin::Manual).unwrap();

    assert_eq!(queue.process_queue().unwrap(), vec![first.clone()]);
    assert_eq!(env.ledger().status(&second).unwrap(), JobStatus::Pending);

    // Completion of the first re-runs admission, which starts the second.
    env.fetcher.open_gate(2);
    queue.wait_idle().await;

    assert_eq!(env.ledger().status(&first).unwrap(), JobStatus::Completed);
    assert_eq!(env.ledger().status(&second).unwrap(), JobStatus::Completed);
    assert_eq!(env.fetcher.fetch_count(), 2);
}

/// At most the ceiling running, and never two on one resource.
fn assert_running_within_limits(ledger: &JobLedger) -> usize {
    let running = ledger.running(100).unwrap();
    assert!(running.len() <= 5, "{} jobs running", running.len());
    let resources: HashSet<&str> = running.iter().map(|j| j.resource_key.as_str()).collect();
    assert_eq!(resources.len(), running.len(), "two jobs running on one resource");
    running.len()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_schedule_and_admission_never_exceed_limits() {
    let env = TestEnv::gated();
    let queue = &env.services.queue;

    let keys: Vec<String> = (0..6)
        .map(|_| sync_resource_key(&env.add_feed(products("p", 1)).id))
        .collect();
    for key in &keys {
        queue.schedule(JobKind::Sync, key, JobOrigin::Scheduled).unwrap();
    }

    // Schedules for the same resources race with admission passes and
    // with readers checking the running set.
    let mut tasks = Vec::new();
    for _ in 0..4 {
        for key in &keys {
            let (queue, key) = (Arc::clone(queue), key.clone());
            tasks.push(tokio::task::spawn_blocking(move || {
                if let Err(e) = queue.schedule(JobKind::Sync, &key, JobOrigin::Manual) {
                    assert!(matches!(e, QueueError::AlreadyRunning { .. }), "{}", e);
                }
                Vec::new()
            }));
        }
        for _ in 0..2 {
            let queue = Arc::clone(queue);
            tasks.push(tokio::task::spawn_blocking(move || queue.process_queue().unwrap()));
        }
        let ledger = env.ledger().clone();
        tasks.push(tokio::task::spawn_blocking(move || {
            assert_running_within_limits(&ledger);
            Vec::new()
        }));
    }

    let mut started = Vec::new();
    for result in join_all(tasks).await {
        started.extend(result.unwrap());
    }
    let unique: HashSet<&String> = started.iter().collect();
    assert_eq!(unique.len(), started.len(), "a job was started twice");
    // Every fetch is blocked, so nothing has finished yet.
    assert_eq!(started.len(), 5);
    assert_eq!(assert_running_within_limits(env.ledger()), 5);

    env.fetcher.open_gate(1000);
    queue.wait_idle().await;

    assert_eq!(env.ledger().count(JobStatus::Pending).unwrap(), 0);
    assert_eq!(env.ledger().count(JobStatus::Running).unwrap(), 0);
    assert_eq!(env.ledger().count(JobStatus::Failed).unwrap(), 0);
    assert!(env.ledger().count(JobStatus::Completed).unwrap() >= 6);
}

#[tokio::test]
async fn test_cancel_running_job_halts_it() {
    let env = TestEnv::gated();
    let queue = &env.services.queue;
    let feed = env.add_feed(products("p", 10));

    let id = queue
        .schedule(JobKind::Sync, &sync_resource_key(&feed.id), JobOrigin::Manual)
        .unwrap();
    queue.process_queue().unwrap();
    assert!(env.ledger().cancel(&id).unwrap());

    env.fetcher.open_gate(1);
    queue.wait_idle().await;

    let job = env.ledger().require(&id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("Cancelled by operator"));
    assert!(env.store.upserted().is_empty());
    assert!(env.notifier.events().is_empty());
}

#[tokio::test]
async fn test_failed_fetch_fails_job_and_frees_slot() {
    let env = TestEnv::new();
    let queue = &env.services.queue;

    // Registered in the ledger but never served by the fetcher.
    let mut feed = feedsync::feed::Feed::new("user-1", "Broken", "https://feeds.example.com/404.xml");
    feed.id = "broken".to_string();
    feedsync::db::feed_repo::insert(&env.db, &feed).unwrap();

    let id = queue
        .schedule(JobKind::Sync, &sync_resource_key(&feed.id), JobOrigin::Manual)
        .unwrap();
    queue.process_queue().unwrap();
    queue.wait_idle().await;

    let job = env.ledger().require(&id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().contains("404"));
    assert_eq!(queue.status().unwrap().active, 0);
}
