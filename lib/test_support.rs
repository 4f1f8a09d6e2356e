use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use crate::config::{CategoryTable, EndpointCategory};
use crate::queue::Priority;
use crate::rate_governor::RateGovernor;
use crate::remote::{FetchError, FetchErrorKind, FetchResponse, RemoteFetcher, RemoteItem};
use crate::scanner::ScanCheckpoint;
use crate::store::{EntityRoster, StoreError, SyncStore, SyncedEntity};
use crate::EntityId;

pub(crate) fn test_governor(
    category: &str,
    max_calls: u32,
    window_secs: u64,
    penalty_secs: u64,
) -> Arc<RateGovernor> {
    let table = CategoryTable::new(vec![EndpointCategory::new(
        category,
        max_calls,
        Duration::from_secs(window_secs),
        Duration::from_secs(penalty_secs),
    )])
    .expect("valid category table");
    Arc::new(RateGovernor::new(&table))
}

pub(crate) fn found(key: i64, participants: Vec<EntityId>) -> Result<FetchResponse, FetchError> {
    Ok(FetchResponse::Found(RemoteItem {
        key,
        payload: serde_json::json!({ "id": key, "participants": participants }),
        participants,
    }))
}

pub(crate) fn fetch_error(kind: FetchErrorKind) -> Result<FetchResponse, FetchError> {
    Err(FetchError::new(kind, format!("scripted {kind:?} failure")))
}

/// Scripted responses per key; unscripted keys answer from the participant map, else `NotFound`.
#[derive(Default)]
pub(crate) struct MockFetcher {
    plans: Mutex<HashMap<i64, VecDeque<Result<FetchResponse, FetchError>>>>,
    participants: Mutex<HashMap<i64, Vec<EntityId>>>,
    hang_at: Mutex<Option<i64>>,
    panic_at: Mutex<Option<i64>>,
    latency: Mutex<Option<Duration>>,
    call_counts: Mutex<HashMap<i64, u32>>,
    call_log: Mutex<Vec<(String, i64)>>,
}

impl MockFetcher {
    pub(crate) fn with_plan(plan: Vec<(i64, Vec<Result<FetchResponse, FetchError>>)>) -> Self {
        let fetcher = Self::default();
        {
            let mut plans = fetcher.plans.lock().expect("plans mutex poisoned");
            for (key, entries) in plan {
                plans.insert(key, entries.into_iter().collect());
            }
        }
        fetcher
    }

    /// Every key in `keys` resolves to an item involving `target`.
    pub(crate) fn with_matches(self, target: EntityId, keys: &[i64]) -> Self {
        {
            let mut participants = self.participants.lock().expect("participants mutex poisoned");
            for key in keys {
                participants.insert(*key, vec![target, target + 1_000]);
            }
        }
        self
    }

    /// Keys not otherwise scripted resolve to items that do not involve `target`.
    pub(crate) fn with_items(self, other: EntityId, keys: impl IntoIterator<Item = i64>) -> Self {
        {
            let mut participants = self.participants.lock().expect("participants mutex poisoned");
            for key in keys {
                participants.entry(key).or_insert_with(|| vec![other]);
            }
        }
        self
    }

    /// Fetching `key` never completes.
    pub(crate) fn hanging_at(self, key: i64) -> Self {
        *self.hang_at.lock().expect("hang mutex poisoned") = Some(key);
        self
    }

    /// Fetching `key` panics.
    pub(crate) fn panicking_at(self, key: i64) -> Self {
        *self.panic_at.lock().expect("panic mutex poisoned") = Some(key);
        self
    }

    /// Every fetch takes `latency` before answering.
    pub(crate) fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock().expect("latency mutex poisoned") = Some(latency);
        self
    }

    pub(crate) fn calls_for(&self, key: i64) -> u32 {
        *self
            .call_counts
            .lock()
            .expect("call_count mutex poisoned")
            .get(&key)
            .unwrap_or(&0)
    }

    pub(crate) fn call_log(&self) -> Vec<(String, i64)> {
        self.call_log.lock().expect("call_log mutex poisoned").clone()
    }

    pub(crate) fn fetched_keys(&self) -> Vec<i64> {
        self.call_log().into_iter().map(|(_, key)| key).collect()
    }
}

impl RemoteFetcher for MockFetcher {
    fn fetch<'a>(
        &'a self,
        category: &'a str,
        key: i64,
    ) -> BoxFuture<'a, Result<FetchResponse, FetchError>> {
        Box::pin(async move {
            {
                let mut counts = self.call_counts.lock().expect("call_count mutex poisoned");
                *counts.entry(key).or_insert(0) += 1;
            }
            self.call_log
                .lock()
                .expect("call_log mutex poisoned")
                .push((category.to_string(), key));

            if *self.hang_at.lock().expect("hang mutex poisoned") == Some(key) {
                return futures::future::pending().await;
            }
            let latency = *self.latency.lock().expect("latency mutex poisoned");
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            let panics = *self.panic_at.lock().expect("panic mutex poisoned") == Some(key);
            if panics {
                panic!("scripted panic fetching {key}");
            }

            let scripted = self
                .plans
                .lock()
                .expect("plans mutex poisoned")
                .get_mut(&key)
                .and_then(VecDeque::pop_front);
            if let Some(response) = scripted {
                return response;
            }

            let participants = self
                .participants
                .lock()
                .expect("participants mutex poisoned")
                .get(&key)
                .cloned();
            match participants {
                Some(participants) => found(key, participants),
                None => Ok(FetchResponse::NotFound),
            }
        })
    }
}

#[derive(Default)]
pub(crate) struct MemoryStore {
    entities: Mutex<Vec<SyncedEntity>>,
    checkpoints: Mutex<HashMap<String, ScanCheckpoint>>,
    checkpoint_saves: Mutex<Vec<ScanCheckpoint>>,
    roster: Mutex<HashMap<Priority, Vec<EntityId>>>,
    fail_entity_saves: AtomicBool,
    fail_checkpoint_saves: AtomicBool,
    fail_roster: AtomicBool,
}

impl MemoryStore {
    pub(crate) fn with_roster(entries: &[(EntityId, Priority)]) -> Self {
        let store = Self::default();
        {
            let mut roster = store.roster.lock().expect("roster mutex poisoned");
            for (entity_id, priority) in entries {
                roster.entry(*priority).or_default().push(*entity_id);
            }
        }
        store
    }

    pub(crate) fn insert_checkpoint(&self, checkpoint: ScanCheckpoint) {
        self.checkpoints
            .lock()
            .expect("checkpoints mutex poisoned")
            .insert(checkpoint.scan_id.clone(), checkpoint);
    }

    pub(crate) fn checkpoint(&self, scan_id: &str) -> Option<ScanCheckpoint> {
        self.checkpoints
            .lock()
            .expect("checkpoints mutex poisoned")
            .get(scan_id)
            .cloned()
    }

    /// Every checkpoint write in order, including the initial one.
    pub(crate) fn checkpoint_saves(&self) -> Vec<ScanCheckpoint> {
        self.checkpoint_saves
            .lock()
            .expect("checkpoint_saves mutex poisoned")
            .clone()
    }

    pub(crate) fn saved_entity_keys(&self) -> Vec<String> {
        self.entities
            .lock()
            .expect("entities mutex poisoned")
            .iter()
            .map(|entity| entity.entity_key.clone())
            .collect()
    }

    pub(crate) fn fail_entity_saves(&self, fail: bool) {
        self.fail_entity_saves.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_checkpoint_saves(&self, fail: bool) {
        self.fail_checkpoint_saves.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_roster(&self, fail: bool) {
        self.fail_roster.store(fail, Ordering::SeqCst);
    }
}

impl SyncStore for MemoryStore {
    fn save_entity<'a>(&'a self, entity: &'a SyncedEntity) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            if self.fail_entity_saves.load(Ordering::SeqCst) {
                return Err(StoreError::InvalidRow("simulated entity write failure".to_string()));
            }
            let mut entities = self.entities.lock().expect("entities mutex poisoned");
            entities.retain(|existing| {
                existing.category != entity.category || existing.entity_key != entity.entity_key
            });
            entities.push(entity.clone());
            Ok(())
        })
    }

    fn save_checkpoint<'a>(
        &'a self,
        checkpoint: &'a ScanCheckpoint,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            if self.fail_checkpoint_saves.load(Ordering::SeqCst) {
                return Err(StoreError::InvalidRow("simulated checkpoint write failure".to_string()));
            }
            self.checkpoint_saves
                .lock()
                .expect("checkpoint_saves mutex poisoned")
                .push(checkpoint.clone());
            self.insert_checkpoint(checkpoint.clone());
            Ok(())
        })
    }

    fn load_checkpoint<'a>(
        &'a self,
        scan_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<ScanCheckpoint>, StoreError>> {
        Box::pin(async move { Ok(self.checkpoint(scan_id)) })
    }
}

impl EntityRoster for MemoryStore {
    fn entities_with_priority<'a>(
        &'a self,
        priority: Priority,
    ) -> BoxFuture<'a, Result<Vec<EntityId>, StoreError>> {
        Box::pin(async move {
            if self.fail_roster.load(Ordering::SeqCst) {
                return Err(StoreError::InvalidRow("simulated roster failure".to_string()));
            }
            Ok(self
                .roster
                .lock()
                .expect("roster mutex poisoned")
                .get(&priority)
                .cloned()
                .unwrap_or_default())
        })
    }
}
