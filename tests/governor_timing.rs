use std::sync::{Arc, Mutex};
use std::time::Duration;

use rider_sync_lib::config::categories::{CLUB_ROSTER, RIDER_INDIVIDUAL};
use rider_sync_lib::config::CategoryTable;
use rider_sync_lib::rate_governor::RateGovernor;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[tokio::test(start_paused = true)]
async fn builtin_club_roster_budget_spaces_calls_by_window_and_penalty() {
    let governor = RateGovernor::new(&CategoryTable::builtin());
    let cancel = CancellationToken::new();
    let start = Instant::now();

    governor
        .authorize(CLUB_ROSTER, &cancel)
        .await
        .expect("first call")
        .record_usage();
    governor
        .authorize(CLUB_ROSTER, &cancel)
        .await
        .expect("second call")
        .record_usage();

    assert!(start.elapsed() >= Duration::from_secs(65 * 60));
    assert!(start.elapsed() < Duration::from_secs(66 * 60));
}

#[tokio::test(start_paused = true)]
async fn concurrent_waiters_are_served_in_arrival_order() {
    let governor = Arc::new(RateGovernor::new(&CategoryTable::builtin()));
    let cancel = CancellationToken::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut tasks = Vec::new();
    for caller in 0..8 {
        let governor = governor.clone();
        let cancel = cancel.clone();
        let order = order.clone();
        tasks.push(tokio::spawn(async move {
            let permit = governor
                .authorize(RIDER_INDIVIDUAL, &cancel)
                .await
                .expect("authorized");
            order.lock().expect("order mutex poisoned").push(caller);
            permit.record_usage();
        }));
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }
    for task in tasks {
        task.await.expect("caller task");
    }

    assert_eq!(
        *order.lock().expect("order mutex poisoned"),
        (0..8).collect::<Vec<_>>()
    );
    let status = governor.status(RIDER_INDIVIDUAL).expect("known category");
    assert_eq!(status.max_calls, 5);
    assert!(status.used <= status.max_calls);
}

#[tokio::test(start_paused = true)]
async fn status_lists_every_builtin_category_with_friendly_names() {
    let governor = RateGovernor::new(&CategoryTable::builtin());
    let statuses = governor.status_all();

    assert_eq!(statuses.len(), 7);
    assert!(statuses
        .iter()
        .all(|status| !status.friendly_name.is_empty() && status.used == 0));
}
