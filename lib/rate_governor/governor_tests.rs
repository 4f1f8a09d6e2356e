use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{GovernorError, RateGovernor};
use crate::config::{CategoryTable, EndpointCategory};
use crate::remote::{FetchError, FetchErrorKind};

const CATEGORY: &str = "event-results";

fn governor(max_calls: u32, window_secs: u64, penalty_secs: u64) -> RateGovernor {
    let table = CategoryTable::new(vec![EndpointCategory::new(
        CATEGORY,
        max_calls,
        Duration::from_secs(window_secs),
        Duration::from_secs(penalty_secs),
    )])
    .expect("valid category table");
    RateGovernor::new(&table)
}

async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn second_call_waits_window_plus_penalty() {
    let governor = governor(1, 60, 5);
    let cancel = CancellationToken::new();
    let start = Instant::now();

    governor
        .authorize(CATEGORY, &cancel)
        .await
        .expect("first call is immediate")
        .record_usage();
    assert_eq!(start.elapsed(), Duration::ZERO);

    let permit = governor
        .authorize(CATEGORY, &cancel)
        .await
        .expect("second call eventually authorized");
    let waited = start.elapsed();
    assert!(waited >= Duration::from_secs(65), "waited only {waited:?}");
    assert!(waited < Duration::from_secs(66), "waited too long {waited:?}");
    permit.record_usage();
}

#[tokio::test(start_paused = true)]
async fn recorded_calls_never_exceed_ceiling_in_any_window() {
    let governor = governor(5, 60, 0);
    let cancel = CancellationToken::new();
    let start = Instant::now();
    let mut call_times = Vec::new();

    for step in 0u64..23 {
        tokio::time::sleep(Duration::from_secs(step % 7)).await;
        governor
            .authorize(CATEGORY, &cancel)
            .await
            .expect("authorized")
            .record_usage();
        call_times.push(start.elapsed());
    }

    for (idx, opened_at) in call_times.iter().enumerate() {
        let in_window = call_times[idx..]
            .iter()
            .filter(|at| **at - *opened_at < Duration::from_secs(60))
            .count();
        assert!(in_window <= 5, "{in_window} calls within 60s of {opened_at:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn cancelled_authorize_consumes_no_budget() {
    let governor = Arc::new(governor(1, 60, 5));
    let start = Instant::now();
    governor
        .authorize(CATEGORY, &CancellationToken::new())
        .await
        .expect("first call")
        .record_usage();

    let cancel = CancellationToken::new();
    let waiter = {
        let governor = Arc::clone(&governor);
        let cancel = cancel.clone();
        tokio::spawn(async move { governor.authorize(CATEGORY, &cancel).await.map(|_| ()) })
    };

    tokio::time::sleep(Duration::from_secs(10)).await;
    cancel.cancel();
    let result = waiter.await.expect("waiter task joined");
    assert_eq!(
        result,
        Err(GovernorError::Cancelled {
            category: CATEGORY.to_string()
        })
    );

    let status = governor.status(CATEGORY).expect("status");
    assert_eq!(status.used, 1);
    assert_eq!(status.reserved, 0);
    assert_eq!(status.waiters, 0);

    governor
        .authorize(CATEGORY, &CancellationToken::new())
        .await
        .expect("next caller authorized")
        .record_usage();
    assert!(start.elapsed() < Duration::from_secs(66));
}

#[tokio::test(start_paused = true)]
async fn dropped_permit_returns_its_slot() {
    let governor = governor(1, 60, 5);
    let cancel = CancellationToken::new();
    let start = Instant::now();

    drop(governor.authorize(CATEGORY, &cancel).await.expect("first"));
    let _second = governor.authorize(CATEGORY, &cancel).await.expect("second");

    assert_eq!(start.elapsed(), Duration::ZERO);
    assert_eq!(governor.status(CATEGORY).expect("status").used, 0);
}

#[tokio::test(start_paused = true)]
async fn outstanding_permits_block_until_released() {
    let governor = Arc::new(governor(2, 60, 0));
    let cancel = CancellationToken::new();
    let first = governor.authorize(CATEGORY, &cancel).await.expect("first");
    let _second = governor.authorize(CATEGORY, &cancel).await.expect("second");

    let third = {
        let governor = Arc::clone(&governor);
        tokio::spawn(async move {
            governor
                .authorize(CATEGORY, &CancellationToken::new())
                .await
                .map(|permit| permit.record_usage())
        })
    };
    settle().await;
    assert!(!third.is_finished(), "third permit must wait for a free slot");

    drop(first);
    third
        .await
        .expect("third task joined")
        .expect("third authorized after release");
    assert_eq!(governor.status(CATEGORY).expect("status").used, 1);
}

#[tokio::test(start_paused = true)]
async fn waiters_are_served_in_arrival_order() {
    let governor = Arc::new(governor(1, 10, 0));
    governor
        .authorize(CATEGORY, &CancellationToken::new())
        .await
        .expect("first")
        .record_usage();

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for idx in 0..3 {
        let governor = Arc::clone(&governor);
        let order = Arc::clone(&order);
        handles.push(tokio::spawn(async move {
            let permit = governor
                .authorize(CATEGORY, &CancellationToken::new())
                .await
                .expect("authorized");
            order.lock().expect("order mutex poisoned").push(idx);
            permit.record_usage();
        }));
        settle().await;
    }

    for handle in handles {
        handle.await.expect("waiter joined");
    }
    assert_eq!(*order.lock().expect("order mutex poisoned"), vec![0, 1, 2]);
}

#[tokio::test(start_paused = true)]
async fn status_reports_waiters_and_next_availability() {
    let governor = Arc::new(governor(1, 60, 5));
    governor
        .authorize(CATEGORY, &CancellationToken::new())
        .await
        .expect("first")
        .record_usage();

    let idle = governor.status(CATEGORY).expect("status");
    assert_eq!(idle.waiters, 0);
    assert_eq!(idle.next_available_in_ms, 65_000);

    let cancel = CancellationToken::new();
    let waiter = {
        let governor = Arc::clone(&governor);
        let cancel = cancel.clone();
        tokio::spawn(async move { governor.authorize(CATEGORY, &cancel).await.map(|_| ()) })
    };
    settle().await;

    let waiting = governor.status(CATEGORY).expect("status");
    assert_eq!(waiting.waiters, 1);
    assert_eq!(waiting.used, 1);
    assert_eq!(waiting.max_calls, 1);
    assert_eq!(waiting.friendly_name, CATEGORY);

    cancel.cancel();
    assert!(waiter.await.expect("joined").is_err());
}

#[tokio::test(start_paused = true)]
async fn execute_with_limit_records_remote_rejections_only() {
    let governor = governor(3, 60, 0);
    let cancel = CancellationToken::new();

    let rejected = governor
        .execute_with_limit(CATEGORY, &cancel, || async {
            Err::<(), _>(FetchError::new(FetchErrorKind::RateLimited, "429"))
        })
        .await
        .expect("authorized");
    assert!(rejected.is_err());
    assert_eq!(governor.status(CATEGORY).expect("status").used, 1);

    let network = governor
        .execute_with_limit(CATEGORY, &cancel, || async {
            Err::<(), _>(FetchError::new(FetchErrorKind::Network, "reset"))
        })
        .await
        .expect("authorized");
    assert!(network.is_err());
    assert_eq!(governor.status(CATEGORY).expect("status").used, 1);

    let ok = governor
        .execute_with_limit(CATEGORY, &cancel, || async { Ok::<_, FetchError>(7) })
        .await
        .expect("authorized");
    assert_eq!(ok, Ok(7));

    let status = governor.status(CATEGORY).expect("status");
    assert_eq!(status.used, 2);
    assert_eq!(status.reserved, 0);
}

#[tokio::test]
async fn unknown_category_is_rejected() {
    let governor = governor(1, 60, 0);
    let err = governor
        .authorize("podcasts", &CancellationToken::new())
        .await
        .expect_err("unknown category");
    assert_eq!(err, GovernorError::UnknownCategory("podcasts".to_string()));
    assert!(governor.status("podcasts").is_err());
    assert_eq!(governor.status_all().len(), 1);
}
