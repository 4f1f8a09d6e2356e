use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{PriorityScheduler, SchedulerError};
use crate::config::tiers::TierIntervals;
use crate::queue::{Priority, SyncJobQueue};
use crate::test_support::MemoryStore;

fn minutes(value: u64) -> Duration {
    Duration::from_secs(value * 60)
}

fn scheduler_with(
    entries: &[(i64, Priority)],
) -> (PriorityScheduler, Arc<SyncJobQueue>, Arc<MemoryStore>) {
    let queue = Arc::new(SyncJobQueue::default());
    let roster = Arc::new(MemoryStore::with_roster(entries));
    let scheduler = PriorityScheduler::new(queue.clone(), roster.clone(), &CancellationToken::new());
    (scheduler, queue, roster)
}

fn pending_entities(queue: &SyncJobQueue) -> Vec<i64> {
    let mut entities: Vec<i64> = queue
        .status()
        .active
        .into_iter()
        .map(|job| job.entity_id)
        .collect();
    entities.sort_unstable();
    entities
}

#[tokio::test(start_paused = true)]
async fn tiers_fire_on_their_own_period() {
    let (scheduler, queue, _) =
        scheduler_with(&[(1, Priority::P1), (2, Priority::P1), (3, Priority::P3)]);
    scheduler
        .start(TierIntervals::default())
        .await
        .expect("scheduler starts");

    tokio::time::sleep(minutes(14)).await;
    assert!(pending_entities(&queue).is_empty(), "nothing runs before the first period");

    tokio::time::sleep(minutes(2)).await;
    assert_eq!(pending_entities(&queue), vec![1, 2]);

    tokio::time::sleep(minutes(45)).await;
    assert_eq!(pending_entities(&queue), vec![1, 2, 3]);

    let status = scheduler.status().await;
    let p1 = &status.tiers[0];
    assert_eq!(p1.runs_total, 4, "P1 ran at 15, 30, 45 and 60 minutes");
    let last = p1.last_run.as_ref().expect("P1 has run");
    assert_eq!(last.total, 2);
    assert_eq!(last.duplicates, 2, "jobs were still pending");

    scheduler.stop().await.expect("scheduler stops");
}

#[tokio::test(start_paused = true)]
async fn manual_tier_run_skips_active_entities() {
    let (scheduler, queue, _) = scheduler_with(&[(10, Priority::P2), (11, Priority::P2)]);

    let first = scheduler
        .run_tier_now(Priority::P2)
        .await
        .expect("roster loads");
    assert_eq!((first.total, first.queued, first.duplicates), (2, 2, 0));

    let second = scheduler
        .run_tier_now(Priority::P2)
        .await
        .expect("roster loads");
    assert_eq!((second.total, second.queued, second.duplicates), (2, 0, 2));

    let status = queue.status();
    assert_eq!(status.pending, 2);
    assert_eq!(status.duplicates_total, 2);
    assert!(status
        .active
        .iter()
        .all(|job| job.requested_by == super::SCHEDULER_REQUESTER));
}

#[tokio::test(start_paused = true)]
async fn lifecycle_rejects_double_start_and_stop() {
    let (scheduler, _, _) = scheduler_with(&[]);
    assert!(!scheduler.status().await.running);
    assert!(matches!(
        scheduler.stop().await,
        Err(SchedulerError::NotRunning)
    ));

    scheduler
        .start(TierIntervals::default())
        .await
        .expect("scheduler starts");
    assert!(matches!(
        scheduler.start(TierIntervals::default()).await,
        Err(SchedulerError::AlreadyRunning)
    ));

    let status = scheduler.status().await;
    assert!(status.running);
    let next: Vec<Option<u64>> = status.tiers.iter().map(|t| t.next_run_in_secs).collect();
    assert_eq!(next, vec![Some(900), Some(1_800), Some(3_600), Some(7_200)]);

    scheduler.stop().await.expect("scheduler stops");
    let status = scheduler.status().await;
    assert!(!status.running);
    assert!(status.tiers.iter().all(|t| t.next_run_in_secs.is_none()));
}

#[tokio::test(start_paused = true)]
async fn restart_applies_new_intervals() {
    let (scheduler, queue, _) = scheduler_with(&[(5, Priority::P1)]);
    scheduler
        .start(TierIntervals::default())
        .await
        .expect("scheduler starts");

    let faster = TierIntervals::sanitized([Some(5), None, None, None]);
    scheduler.restart(faster).await.expect("scheduler restarts");
    assert_eq!(scheduler.status().await.tiers[0].interval_minutes, 5);

    tokio::time::sleep(minutes(6)).await;
    assert_eq!(pending_entities(&queue), vec![5]);
}

#[tokio::test(start_paused = true)]
async fn roster_failure_is_reported_and_next_period_retries() {
    let (scheduler, queue, roster) = scheduler_with(&[(8, Priority::P1)]);
    roster.fail_roster(true);
    scheduler
        .start(TierIntervals::default())
        .await
        .expect("scheduler starts");

    tokio::time::sleep(minutes(16)).await;
    let p1 = scheduler.status().await.tiers[0].clone();
    assert!(p1
        .last_error
        .as_deref()
        .is_some_and(|err| err.contains("P1 roster")));
    assert_eq!(p1.runs_total, 0);
    assert!(pending_entities(&queue).is_empty());

    roster.fail_roster(false);
    tokio::time::sleep(minutes(15)).await;
    let p1 = scheduler.status().await.tiers[0].clone();
    assert_eq!(p1.last_error, None);
    assert_eq!(p1.runs_total, 1);
    assert_eq!(pending_entities(&queue), vec![8]);
}
