//! Persistence contracts for work items, trackers and tracker queries, plus
//! the Postgres and in-memory backends implementing them.

use async_trait::async_trait;
use rwi_core::{ExternalKey, ProviderType, Tracker, TrackerQuery, WorkItem, WorkItemError};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

mod memory;
mod postgres;

pub use memory::{InMemoryBackend, InMemoryTx};
pub use postgres::{PgBackend, PgTx};

pub const CRATE_NAME: &str = "rwi-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} with id '{id}' not found")]
    NotFound { entity: &'static str, id: String },
    #[error("a work item already exists for external key {0}")]
    DuplicateExternalKey(ExternalKey),
    #[error("bad parameter '{parameter}': {reason}")]
    BadParameter {
        parameter: &'static str,
        reason: String,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decoding stored value: {0}")]
    Decode(#[from] serde_json::Error),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        StoreError::NotFound {
            entity,
            id: id.into(),
        }
    }
}

impl From<StoreError> for WorkItemError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => WorkItemError::NotFound { entity, id },
            StoreError::BadParameter { parameter, reason } => {
                WorkItemError::BadParameter { parameter, reason }
            }
            other => WorkItemError::internal(other),
        }
    }
}

/// Result of a keyed lookup that may legitimately find nothing.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Found(T),
    Missing,
}

#[async_trait]
pub trait WorkItemStore: Send {
    async fn find_by_external_key(
        &mut self,
        key: &ExternalKey,
    ) -> Result<Lookup<WorkItem>, StoreError>;

    async fn load_work_item(&mut self, id: Uuid) -> Result<WorkItem, StoreError>;

    /// Insert a new work item. Fails with [`StoreError::DuplicateExternalKey`]
    /// when another item already holds the same external key.
    async fn create_work_item(&mut self, item: WorkItem) -> Result<WorkItem, StoreError>;

    async fn update_work_item(&mut self, item: WorkItem) -> Result<WorkItem, StoreError>;

    async fn delete_work_item(&mut self, id: Uuid) -> Result<(), StoreError>;

    async fn list_work_items(&mut self, tracker_query_id: &str)
        -> Result<Vec<WorkItem>, StoreError>;
}

#[async_trait]
pub trait TrackerStore: Send {
    async fn create_tracker(
        &mut self,
        url: &str,
        provider_type: &ProviderType,
    ) -> Result<Tracker, StoreError>;

    async fn load_tracker(&mut self, id: &str) -> Result<Tracker, StoreError>;

    async fn save_tracker(&mut self, tracker: &Tracker) -> Result<Tracker, StoreError>;

    async fn delete_tracker(&mut self, id: &str) -> Result<(), StoreError>;

    async fn list_trackers(&mut self) -> Result<Vec<Tracker>, StoreError>;
}

#[async_trait]
pub trait TrackerQueryStore: Send {
    async fn create_tracker_query(
        &mut self,
        query: &str,
        schedule: &str,
        tracker_id: &str,
    ) -> Result<TrackerQuery, StoreError>;

    async fn load_tracker_query(&mut self, id: &str) -> Result<TrackerQuery, StoreError>;

    async fn save_tracker_query(
        &mut self,
        tracker_query: &TrackerQuery,
    ) -> Result<TrackerQuery, StoreError>;

    async fn delete_tracker_query(&mut self, id: &str) -> Result<(), StoreError>;

    async fn list_tracker_queries(&mut self) -> Result<Vec<TrackerQuery>, StoreError>;
}

/// A unit of work spanning every store. Dropping it without `commit` discards
/// its writes.
#[async_trait]
pub trait StorageTx: WorkItemStore + TrackerStore + TrackerQueryStore + Send {
    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait StorageBackend: Clone + Send + Sync + 'static {
    type Tx: StorageTx + 'static;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub(crate) fn parse_id(entity: &'static str, raw: &str) -> Result<i64, StoreError> {
    rwi_core::parse_numeric_id(entity, raw).map_err(|_| StoreError::not_found(entity, raw))
}

pub(crate) fn require_non_empty(parameter: &'static str, value: &str) -> Result<(), StoreError> {
    if value.trim().is_empty() {
        return Err(StoreError::BadParameter {
            parameter,
            reason: "must not be empty".to_string(),
        });
    }
    Ok(())
}
