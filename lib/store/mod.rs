//! Persistence collaborator used by workers, scans and the scheduler.

mod sqlite;

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use thiserror::Error;

use crate::queue::Priority;
use crate::remote::RemoteItem;
use crate::scanner::ScanCheckpoint;
use crate::EntityId;

pub use sqlite::SqliteSyncStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open database: {0}")]
    Connect(#[from] diesel::ConnectionError),

    #[error(transparent)]
    Database(#[from] diesel::result::Error),

    #[error("failed to run migrations: {0}")]
    Migration(String),

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("stored row is invalid: {0}")]
    InvalidRow(String),

    #[error("database task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

/// One fetched record ready for persistence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncedEntity {
    pub category: String,
    pub entity_key: String,
    pub payload: serde_json::Value,
}

impl SyncedEntity {
    pub fn from_item(category: &str, item: &RemoteItem) -> Self {
        Self {
            category: category.to_string(),
            entity_key: item.key.to_string(),
            payload: item.payload.clone(),
        }
    }
}

/// Writes are upserts so re-delivery after a crash or resume is harmless.
pub trait SyncStore: Send + Sync {
    fn save_entity<'a>(&'a self, entity: &'a SyncedEntity) -> BoxFuture<'a, Result<(), StoreError>>;

    fn save_checkpoint<'a>(
        &'a self,
        checkpoint: &'a ScanCheckpoint,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    fn load_checkpoint<'a>(
        &'a self,
        scan_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<ScanCheckpoint>, StoreError>>;
}

impl<T> SyncStore for Arc<T>
where
    T: SyncStore + ?Sized,
{
    fn save_entity<'a>(&'a self, entity: &'a SyncedEntity) -> BoxFuture<'a, Result<(), StoreError>> {
        (**self).save_entity(entity)
    }

    fn save_checkpoint<'a>(
        &'a self,
        checkpoint: &'a ScanCheckpoint,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        (**self).save_checkpoint(checkpoint)
    }

    fn load_checkpoint<'a>(
        &'a self,
        scan_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<ScanCheckpoint>, StoreError>> {
        (**self).load_checkpoint(scan_id)
    }
}

/// Source of the entities the scheduler enqueues for each tier.
pub trait EntityRoster: Send + Sync {
    fn entities_with_priority<'a>(
        &'a self,
        priority: Priority,
    ) -> BoxFuture<'a, Result<Vec<EntityId>, StoreError>>;
}

impl<T> EntityRoster for Arc<T>
where
    T: EntityRoster + ?Sized,
{
    fn entities_with_priority<'a>(
        &'a self,
        priority: Priority,
    ) -> BoxFuture<'a, Result<Vec<EntityId>, StoreError>> {
        (**self).entities_with_priority(priority)
    }
}
