use std::sync::{Arc, Mutex, PoisonError};

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::sql_query;
use diesel::sql_types::{BigInt, Nullable, Text};
use diesel::sqlite::SqliteConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use futures::future::BoxFuture;

use super::{EntityRoster, StoreError, SyncStore, SyncedEntity};
use crate::queue::Priority;
use crate::scanner::ScanCheckpoint;
use crate::{epoch_millis, EntityId};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[derive(Debug, QueryableByName)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
struct CheckpointRow {
    #[diesel(sql_type = Text)]
    scan_id: String,
    #[diesel(sql_type = BigInt)]
    target_entity: i64,
    #[diesel(sql_type = Text)]
    category: String,
    #[diesel(sql_type = Text)]
    direction: String,
    #[diesel(sql_type = BigInt)]
    range_start: i64,
    #[diesel(sql_type = BigInt)]
    range_end: i64,
    #[diesel(sql_type = BigInt)]
    current_position: i64,
    #[diesel(sql_type = BigInt)]
    expected_matches: i64,
    #[diesel(sql_type = BigInt)]
    miss_threshold: i64,
    #[diesel(sql_type = BigInt)]
    matches_found: i64,
    #[diesel(sql_type = BigInt)]
    items_scanned: i64,
    #[diesel(sql_type = BigInt)]
    consecutive_misses: i64,
    #[diesel(sql_type = Text)]
    status: String,
    #[diesel(sql_type = Nullable<Text>)]
    status_reason: Option<String>,
    #[diesel(sql_type = BigInt)]
    started_at_ms: i64,
    #[diesel(sql_type = Nullable<BigInt>)]
    last_saved_at_ms: Option<i64>,
}

fn narrow<T: TryFrom<i64>>(column: &str, value: i64) -> Result<T, StoreError> {
    T::try_from(value).map_err(|_| StoreError::InvalidRow(format!("{column} out of range: {value}")))
}

fn widen<T: TryInto<i64>>(column: &str, value: T) -> Result<i64, StoreError> {
    value
        .try_into()
        .map_err(|_| StoreError::InvalidRow(format!("{column} does not fit in BIGINT")))
}

impl TryFrom<CheckpointRow> for ScanCheckpoint {
    type Error = StoreError;

    fn try_from(row: CheckpointRow) -> Result<Self, Self::Error> {
        Ok(Self {
            direction: row.direction.parse().map_err(StoreError::InvalidRow)?,
            status: row.status.parse().map_err(StoreError::InvalidRow)?,
            expected_matches: narrow("expected_matches", row.expected_matches)?,
            miss_threshold: narrow("miss_threshold", row.miss_threshold)?,
            matches_found: narrow("matches_found", row.matches_found)?,
            items_scanned: narrow("items_scanned", row.items_scanned)?,
            consecutive_misses: narrow("consecutive_misses", row.consecutive_misses)?,
            started_at_ms: narrow("started_at_ms", row.started_at_ms)?,
            last_saved_at_ms: row
                .last_saved_at_ms
                .map(|value| narrow("last_saved_at_ms", value))
                .transpose()?,
            scan_id: row.scan_id,
            target_entity: row.target_entity,
            category: row.category,
            range_start: row.range_start,
            range_end: row.range_end,
            current_position: row.current_position,
            status_reason: row.status_reason,
        })
    }
}

#[derive(Debug, QueryableByName)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
struct TrackedRow {
    #[diesel(sql_type = BigInt)]
    entity_id: i64,
    #[diesel(sql_type = BigInt)]
    priority: i64,
}

#[derive(Debug, QueryableByName)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
struct PayloadRow {
    #[diesel(sql_type = Text)]
    payload: String,
}

const CHECKPOINT_COLUMNS: &str = "scan_id, target_entity, category, direction, range_start, \
     range_end, current_position, expected_matches, miss_threshold, matches_found, \
     items_scanned, consecutive_misses, status, status_reason, started_at_ms, last_saved_at_ms";

/// SQLite-backed store; one connection guarded by a mutex, used from blocking tasks.
#[derive(Clone)]
pub struct SqliteSyncStore {
    conn: Arc<Mutex<SqliteConnection>>,
}

impl SqliteSyncStore {
    /// Opens (or creates) the database and applies pending migrations.
    pub fn open(database_url: &str) -> Result<Self, StoreError> {
        let mut conn = SqliteConnection::establish(database_url)?;
        conn.batch_execute("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|err| StoreError::Migration(err.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::open(":memory:")
    }

    async fn run_op<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteConnection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            op(&mut conn)
        })
        .await?
    }

    /// Adds the entity to the roster or changes its tier.
    pub async fn set_priority(&self, entity_id: EntityId, priority: Priority) -> Result<(), StoreError> {
        self.run_op(move |conn| {
            sql_query(
                "INSERT INTO tracked_entities (entity_id, priority, updated_at_ms) VALUES (?, ?, ?) \
                 ON CONFLICT(entity_id) DO UPDATE SET priority = excluded.priority, \
                 updated_at_ms = excluded.updated_at_ms",
            )
            .bind::<BigInt, _>(entity_id)
            .bind::<BigInt, _>(i64::from(priority.get()))
            .bind::<BigInt, _>(widen("updated_at_ms", epoch_millis())?)
            .execute(conn)?;
            Ok(())
        })
        .await
    }

    /// Returns whether the entity was tracked.
    pub async fn untrack(&self, entity_id: EntityId) -> Result<bool, StoreError> {
        self.run_op(move |conn| {
            let removed = sql_query("DELETE FROM tracked_entities WHERE entity_id = ?")
                .bind::<BigInt, _>(entity_id)
                .execute(conn)?;
            Ok(removed > 0)
        })
        .await
    }

    pub async fn tracked_entities(&self) -> Result<Vec<(EntityId, Priority)>, StoreError> {
        self.run_op(|conn| {
            let rows: Vec<TrackedRow> = sql_query(
                "SELECT entity_id, priority FROM tracked_entities ORDER BY priority, entity_id",
            )
            .load(conn)?;
            rows.into_iter()
                .map(|row| {
                    let priority = Priority::new(narrow("priority", row.priority)?)
                        .map_err(|err| StoreError::InvalidRow(err.to_string()))?;
                    Ok((row.entity_id, priority))
                })
                .collect()
        })
        .await
    }

    pub async fn load_entity(
        &self,
        category: &str,
        entity_key: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        let category = category.to_string();
        let entity_key = entity_key.to_string();
        self.run_op(move |conn| {
            let row: Option<PayloadRow> = sql_query(
                "SELECT payload FROM synced_entities WHERE category = ? AND entity_key = ?",
            )
            .bind::<Text, _>(category)
            .bind::<Text, _>(entity_key)
            .get_result(conn)
            .optional()?;
            row.map(|row| serde_json::from_str(&row.payload).map_err(StoreError::from))
                .transpose()
        })
        .await
    }

    pub async fn list_checkpoints(&self) -> Result<Vec<ScanCheckpoint>, StoreError> {
        self.run_op(|conn| {
            let rows: Vec<CheckpointRow> = sql_query(format!(
                "SELECT {CHECKPOINT_COLUMNS} FROM scan_checkpoints ORDER BY started_at_ms, scan_id"
            ))
            .load(conn)?;
            rows.into_iter().map(ScanCheckpoint::try_from).collect()
        })
        .await
    }
}

impl SyncStore for SqliteSyncStore {
    fn save_entity<'a>(&'a self, entity: &'a SyncedEntity) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let category = entity.category.clone();
            let entity_key = entity.entity_key.clone();
            let payload = serde_json::to_string(&entity.payload)?;
            self.run_op(move |conn| {
                sql_query(
                    "INSERT INTO synced_entities (category, entity_key, payload, synced_at_ms) \
                     VALUES (?, ?, ?, ?) \
                     ON CONFLICT(category, entity_key) DO UPDATE SET \
                     payload = excluded.payload, synced_at_ms = excluded.synced_at_ms",
                )
                .bind::<Text, _>(category)
                .bind::<Text, _>(entity_key)
                .bind::<Text, _>(payload)
                .bind::<BigInt, _>(widen("synced_at_ms", epoch_millis())?)
                .execute(conn)?;
                Ok(())
            })
            .await
        })
    }

    fn save_checkpoint<'a>(
        &'a self,
        checkpoint: &'a ScanCheckpoint,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let checkpoint = checkpoint.clone();
            self.run_op(move |conn| {
                sql_query(format!(
                    "INSERT INTO scan_checkpoints ({CHECKPOINT_COLUMNS}) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
                     ON CONFLICT(scan_id) DO UPDATE SET \
                     current_position = excluded.current_position, \
                     matches_found = excluded.matches_found, \
                     items_scanned = excluded.items_scanned, \
                     consecutive_misses = excluded.consecutive_misses, \
                     status = excluded.status, \
                     status_reason = excluded.status_reason, \
                     last_saved_at_ms = excluded.last_saved_at_ms"
                ))
                .bind::<Text, _>(&checkpoint.scan_id)
                .bind::<BigInt, _>(checkpoint.target_entity)
                .bind::<Text, _>(&checkpoint.category)
                .bind::<Text, _>(checkpoint.direction.as_str())
                .bind::<BigInt, _>(checkpoint.range_start)
                .bind::<BigInt, _>(checkpoint.range_end)
                .bind::<BigInt, _>(checkpoint.current_position)
                .bind::<BigInt, _>(i64::from(checkpoint.expected_matches))
                .bind::<BigInt, _>(i64::from(checkpoint.miss_threshold))
                .bind::<BigInt, _>(i64::from(checkpoint.matches_found))
                .bind::<BigInt, _>(widen("items_scanned", checkpoint.items_scanned)?)
                .bind::<BigInt, _>(i64::from(checkpoint.consecutive_misses))
                .bind::<Text, _>(checkpoint.status.as_str())
                .bind::<Nullable<Text>, _>(checkpoint.status_reason.as_deref())
                .bind::<BigInt, _>(widen("started_at_ms", checkpoint.started_at_ms)?)
                .bind::<Nullable<BigInt>, _>(
                    checkpoint
                        .last_saved_at_ms
                        .map(|value| widen("last_saved_at_ms", value))
                        .transpose()?,
                )
                .execute(conn)?;
                Ok(())
            })
            .await
        })
    }

    fn load_checkpoint<'a>(
        &'a self,
        scan_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<ScanCheckpoint>, StoreError>> {
        Box::pin(async move {
            let scan_id = scan_id.to_string();
            self.run_op(move |conn| {
                let row: Option<CheckpointRow> = sql_query(format!(
                    "SELECT {CHECKPOINT_COLUMNS} FROM scan_checkpoints WHERE scan_id = ?"
                ))
                .bind::<Text, _>(scan_id)
                .get_result(conn)
                .optional()?;
                row.map(ScanCheckpoint::try_from).transpose()
            })
            .await
        })
    }
}

impl EntityRoster for SqliteSyncStore {
    fn entities_with_priority<'a>(
        &'a self,
        priority: Priority,
    ) -> BoxFuture<'a, Result<Vec<EntityId>, StoreError>> {
        Box::pin(async move {
            self.run_op(move |conn| {
                let rows: Vec<TrackedRow> = sql_query(
                    "SELECT entity_id, priority FROM tracked_entities \
                     WHERE priority = ? ORDER BY entity_id",
                )
                .bind::<BigInt, _>(i64::from(priority.get()))
                .load(conn)?;
                Ok(rows.into_iter().map(|row| row.entity_id).collect())
            })
            .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::{ScanDirection, ScanRequest, ScanStatus};
    use serde_json::json;

    fn store() -> SqliteSyncStore {
        SqliteSyncStore::open_in_memory().expect("in-memory sqlite opens")
    }

    #[tokio::test]
    async fn save_entity_upserts_by_category_and_key() {
        let store = store();
        let mut entity = SyncedEntity {
            category: "rider-individual".to_string(),
            entity_key: "42".to_string(),
            payload: json!({"name": "first"}),
        };
        store.save_entity(&entity).await.expect("insert");
        entity.payload = json!({"name": "second"});
        store.save_entity(&entity).await.expect("upsert");

        let payload = store
            .load_entity("rider-individual", "42")
            .await
            .expect("load")
            .expect("row present");
        assert_eq!(payload, json!({"name": "second"}));
        assert!(store
            .load_entity("event-results", "42")
            .await
            .expect("load")
            .is_none());
    }

    #[tokio::test]
    async fn checkpoint_upsert_keeps_latest_progress() {
        let store = store();
        let request = ScanRequest {
            scan_id: "rider-7-history".to_string(),
            target_entity: 7,
            range_start: 5_000,
            range_end: 1,
            direction: ScanDirection::Backward,
            expected_matches: 12,
            miss_threshold: 400,
        };
        let mut checkpoint = ScanCheckpoint::new(&request, "event-results", 1_700_000_000_000);
        store.save_checkpoint(&checkpoint).await.expect("initial save");

        checkpoint.current_position = 4_950;
        checkpoint.items_scanned = 50;
        checkpoint.matches_found = 2;
        checkpoint.status = ScanStatus::Paused;
        checkpoint.status_reason = Some("upstream 503".to_string());
        checkpoint.last_saved_at_ms = Some(1_700_000_060_000);
        store.save_checkpoint(&checkpoint).await.expect("update");

        let loaded = store
            .load_checkpoint("rider-7-history")
            .await
            .expect("load")
            .expect("checkpoint present");
        assert_eq!(loaded, checkpoint);
        assert!(store.load_checkpoint("nope").await.expect("load").is_none());
        assert_eq!(store.list_checkpoints().await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn roster_groups_entities_by_priority() {
        let store = store();
        store.set_priority(3, Priority::P2).await.expect("track");
        store.set_priority(1, Priority::P2).await.expect("track");
        store.set_priority(2, Priority::P1).await.expect("track");
        store.set_priority(2, Priority::P2).await.expect("retier");

        let p2 = store
            .entities_with_priority(Priority::P2)
            .await
            .expect("roster");
        assert_eq!(p2, vec![1, 2, 3]);
        assert!(store
            .entities_with_priority(Priority::P1)
            .await
            .expect("roster")
            .is_empty());

        assert!(store.untrack(3).await.expect("untrack"));
        assert!(!store.untrack(3).await.expect("untrack twice"));
        assert_eq!(store.tracked_entities().await.expect("list").len(), 2);
    }
}
