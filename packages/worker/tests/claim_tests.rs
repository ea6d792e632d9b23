//! Queue claim and operator transition tests against a real database.

mod common;

use std::collections::HashSet;

use common::*;
use test_context::test_context;
use worker_core::kernel::jobs::{Job, JobStatus};

#[test_context(TestHarness)]
#[tokio::test]
async fn claim_marks_job_running_with_pid(ctx: &TestHarness) {
    let job = Job::enqueue("site-a", "Site A", "crawl", &ctx.db_pool)
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Queued);

    let claimed = Job::claim_next(4242, &ctx.db_pool)
        .await
        .unwrap()
        .expect("queued job should be claimed");

    assert_eq!(claimed.id, job.id);
    assert_eq!(claimed.status, JobStatus::Running);
    assert_eq!(claimed.pid, Some(4242));
    assert!(claimed.started_at.is_some());
    assert!(claimed.finished_at.is_none());
}

#[test_context(TestHarness)]
#[tokio::test]
async fn empty_queue_yields_nothing(ctx: &TestHarness) {
    let claimed = Job::claim_next(1, &ctx.db_pool).await.unwrap();
    assert!(claimed.is_none());
}

#[test_context(TestHarness)]
#[tokio::test]
async fn oldest_job_is_claimed_first(ctx: &TestHarness) {
    let first = Job::enqueue("first", "First", "crawl", &ctx.db_pool)
        .await
        .unwrap();
    let second = Job::enqueue("second", "Second", "crawl", &ctx.db_pool)
        .await
        .unwrap();

    let a = Job::claim_next(1, &ctx.db_pool).await.unwrap().unwrap();
    let b = Job::claim_next(1, &ctx.db_pool).await.unwrap().unwrap();

    assert_eq!(a.id, first.id);
    assert_eq!(b.id, second.id);
    assert!(Job::claim_next(1, &ctx.db_pool).await.unwrap().is_none());
}

#[test_context(TestHarness)]
#[tokio::test]
async fn concurrent_claimers_never_share_a_job(ctx: &TestHarness) {
    Job::enqueue("contended", "Contended", "crawl", &ctx.db_pool)
        .await
        .unwrap();

    let handles: Vec<_> = (0..8)
        .map(|pid| {
            let pool = ctx.db_pool.clone();
            tokio::spawn(async move { Job::claim_next(pid, &pool).await })
        })
        .collect();

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap().is_some() {
            winners += 1;
        }
    }

    assert_eq!(winners, 1);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn concurrent_claimers_drain_the_queue_without_duplicates(ctx: &TestHarness) {
    for i in 0..20 {
        Job::enqueue(&format!("site-{}", i), "Site", "crawl", &ctx.db_pool)
            .await
            .unwrap();
    }

    let handles: Vec<_> = (0..8)
        .map(|pid| {
            let pool = ctx.db_pool.clone();
            tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(job) = Job::claim_next(pid, &pool).await.unwrap() {
                    claimed.push(job.id);
                }
                claimed
            })
        })
        .collect();

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }

    let unique: HashSet<_> = all.iter().copied().collect();
    assert_eq!(all.len(), 20);
    assert_eq!(unique.len(), 20);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn enqueue_marks_crawl_queued(ctx: &TestHarness) {
    let (_, crawl) = create_project_with_crawl(&ctx.db_pool, "queued-site", None).await;

    Job::enqueue("queued-site", "Queued", "crawl", &ctx.db_pool)
        .await
        .unwrap();

    let (status, in_progress) = crawl_status(&ctx.db_pool, crawl.id).await;
    assert_eq!(status, "queued");
    assert!(in_progress);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn stop_request_on_running_job_moves_it_to_stopping(ctx: &TestHarness) {
    let job = Job::enqueue("stoppable", "Stoppable", "crawl", &ctx.db_pool)
        .await
        .unwrap();
    Job::claim_next(7, &ctx.db_pool).await.unwrap().unwrap();

    let status = Job::request_stop(job.id, &ctx.db_pool).await.unwrap();

    assert_eq!(status, Some(JobStatus::Stopping));
    assert_eq!(
        Job::current_status(job.id, &ctx.db_pool).await.unwrap(),
        Some(JobStatus::Stopping)
    );
}

#[test_context(TestHarness)]
#[tokio::test]
async fn stop_request_on_queued_job_stops_it_at_once(ctx: &TestHarness) {
    let job = Job::enqueue("waiting", "Waiting", "crawl", &ctx.db_pool)
        .await
        .unwrap();

    let status = Job::request_stop(job.id, &ctx.db_pool).await.unwrap();
    assert_eq!(status, Some(JobStatus::Stopped));

    let job = Job::find_by_id(job.id, &ctx.db_pool).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Stopped);
    assert!(job.finished_at.is_some());

    // A stopped job is no longer claimable.
    assert!(Job::claim_next(1, &ctx.db_pool).await.unwrap().is_none());
}

#[test_context(TestHarness)]
#[tokio::test]
async fn stop_request_on_finished_job_is_ignored(ctx: &TestHarness) {
    let job = Job::enqueue("done", "Done", "crawl", &ctx.db_pool)
        .await
        .unwrap();
    Job::request_stop(job.id, &ctx.db_pool).await.unwrap();

    let second = Job::request_stop(job.id, &ctx.db_pool).await.unwrap();
    assert_eq!(second, None);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn orphan_recovery_requeues_running_and_stops_stopping(ctx: &TestHarness) {
    let running = Job::enqueue("orphan", "Orphan", "crawl", &ctx.db_pool)
        .await
        .unwrap();
    let stopping = Job::enqueue("halting", "Halting", "crawl", &ctx.db_pool)
        .await
        .unwrap();
    Job::claim_next(11, &ctx.db_pool).await.unwrap().unwrap();
    Job::claim_next(12, &ctx.db_pool).await.unwrap().unwrap();
    Job::request_stop(stopping.id, &ctx.db_pool).await.unwrap();

    let recovered = Job::recover_orphans(&ctx.db_pool).await.unwrap();

    assert_eq!(recovered.requeued.len(), 1);
    assert_eq!(recovered.requeued[0].id, running.id);
    assert_eq!(recovered.requeued[0].pid, None);
    assert_eq!(recovered.stopped.len(), 1);
    assert_eq!(recovered.stopped[0].id, stopping.id);

    let reclaimed = Job::claim_next(13, &ctx.db_pool).await.unwrap().unwrap();
    assert_eq!(reclaimed.id, running.id);
    assert_eq!(reclaimed.pid, Some(13));

    let logs = Job::logs(running.id, &ctx.db_pool).await.unwrap();
    assert!(logs.iter().any(|log| log.message.contains("re-queued")));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn reset_stops_every_unfinished_job(ctx: &TestHarness) {
    let (_, crawl) = create_project_with_crawl(&ctx.db_pool, "stuck", None).await;
    let running = Job::enqueue("stuck", "Stuck", "crawl", &ctx.db_pool)
        .await
        .unwrap();
    Job::claim_next(1, &ctx.db_pool).await.unwrap().unwrap();
    let queued = Job::enqueue("pending", "Pending", "crawl", &ctx.db_pool)
        .await
        .unwrap();

    let reset = Job::reset_stuck(&ctx.db_pool).await.unwrap();

    let ids: HashSet<_> = reset.iter().map(|job| job.id).collect();
    assert_eq!(ids, HashSet::from([running.id, queued.id]));
    assert!(Job::find_by_status(JobStatus::Stopped, &ctx.db_pool)
        .await
        .unwrap()
        .iter()
        .all(|job| job.finished_at.is_some()));

    let (status, in_progress) = crawl_status(&ctx.db_pool, crawl.id).await;
    assert_eq!(status, "stopped");
    assert!(!in_progress);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn progress_is_clamped(ctx: &TestHarness) {
    let job = Job::enqueue("batch", "Batch", "batch-categorize-project:1", &ctx.db_pool)
        .await
        .unwrap();

    Job::update_progress(job.id, 140, &ctx.db_pool).await.unwrap();
    let job = Job::find_by_id(job.id, &ctx.db_pool).await.unwrap().unwrap();
    assert_eq!(job.progress, 100);
}
