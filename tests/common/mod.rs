#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use rider_sync_lib::remote::{FetchError, FetchResponse, RemoteFetcher, RemoteItem};
use rider_sync_lib::EntityId;

/// Answers every key with a fixed participant list, or `NotFound` when none is set.
#[derive(Default)]
pub struct StaticFetcher {
    participants: HashMap<i64, Vec<EntityId>>,
    calls: Mutex<Vec<(String, i64)>>,
}

impl StaticFetcher {
    pub fn with_participants(entries: Vec<(i64, Vec<EntityId>)>) -> Self {
        Self {
            participants: entries.into_iter().collect(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(String, i64)> {
        self.calls.lock().expect("calls mutex poisoned").clone()
    }
}

impl RemoteFetcher for StaticFetcher {
    fn fetch<'a>(
        &'a self,
        category: &'a str,
        key: i64,
    ) -> BoxFuture<'a, Result<FetchResponse, FetchError>> {
        Box::pin(async move {
            self.calls
                .lock()
                .expect("calls mutex poisoned")
                .push((category.to_string(), key));
            Ok(match self.participants.get(&key) {
                Some(participants) => FetchResponse::Found(RemoteItem {
                    key,
                    participants: participants.clone(),
                    payload: serde_json::json!({ "id": key, "participants": participants }),
                }),
                None => FetchResponse::NotFound,
            })
        })
    }
}

/// Polls `condition` every 10ms until it holds or `timeout` elapses.
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
