//! In-memory backend used by tests and by `rwi-cli` runs without a database.
//!
//! Transactions take an exclusive lock on the shared state and stage their
//! writes on a private copy, which replaces the shared state on commit.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use rwi_core::{ExternalKey, ProviderType, Tracker, TrackerQuery, WorkItem};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;
use uuid::Uuid;

use crate::{
    parse_id, require_non_empty, Lookup, StorageBackend, StorageTx, StoreError, TrackerQueryStore,
    TrackerStore, WorkItemStore,
};

#[derive(Debug, Clone)]
struct TrackerRow {
    url: String,
    provider_type: ProviderType,
}

#[derive(Debug, Clone)]
struct TrackerQueryRow {
    query: String,
    schedule: String,
    tracker_id: i64,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    trackers: BTreeMap<i64, TrackerRow>,
    tracker_queries: BTreeMap<i64, TrackerQueryRow>,
    work_items: HashMap<Uuid, WorkItem>,
    by_external_key: HashMap<ExternalKey, Uuid>,
    last_tracker_id: i64,
    last_tracker_query_id: i64,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    type Tx = InMemoryTx;

    async fn begin(&self) -> Result<InMemoryTx, StoreError> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let staged = guard.clone();
        Ok(InMemoryTx { guard, staged })
    }
}

pub struct InMemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    staged: MemoryState,
}

#[async_trait]
impl StorageTx for InMemoryTx {
    async fn commit(mut self) -> Result<(), StoreError> {
        *self.guard = self.staged;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}

fn tracker_from_row(id: i64, row: &TrackerRow) -> Tracker {
    Tracker {
        id: id.to_string(),
        url: row.url.clone(),
        provider_type: row.provider_type.clone(),
    }
}

fn tracker_query_from_row(id: i64, row: &TrackerQueryRow) -> TrackerQuery {
    TrackerQuery {
        id: id.to_string(),
        query: row.query.clone(),
        schedule: row.schedule.clone(),
        tracker_id: row.tracker_id.to_string(),
    }
}

#[async_trait]
impl WorkItemStore for InMemoryTx {
    async fn find_by_external_key(
        &mut self,
        key: &ExternalKey,
    ) -> Result<Lookup<WorkItem>, StoreError> {
        let found = self
            .staged
            .by_external_key
            .get(key)
            .and_then(|id| self.staged.work_items.get(id))
            .cloned();
        Ok(match found {
            Some(item) => Lookup::Found(item),
            None => Lookup::Missing,
        })
    }

    async fn load_work_item(&mut self, id: Uuid) -> Result<WorkItem, StoreError> {
        self.staged
            .work_items
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("work item", id.to_string()))
    }

    async fn create_work_item(&mut self, item: WorkItem) -> Result<WorkItem, StoreError> {
        let key = item.remote.external_key();
        if self.staged.by_external_key.contains_key(&key) {
            return Err(StoreError::DuplicateExternalKey(key));
        }
        self.staged.by_external_key.insert(key, item.id);
        self.staged.work_items.insert(item.id, item.clone());
        debug!(id = %item.id, "created work item");
        Ok(item)
    }

    async fn update_work_item(&mut self, item: WorkItem) -> Result<WorkItem, StoreError> {
        let Some(existing) = self.staged.work_items.get(&item.id) else {
            return Err(StoreError::not_found("work item", item.id.to_string()));
        };
        let old_key = existing.remote.external_key();
        let new_key = item.remote.external_key();
        if old_key != new_key {
            if self.staged.by_external_key.contains_key(&new_key) {
                return Err(StoreError::DuplicateExternalKey(new_key));
            }
            self.staged.by_external_key.remove(&old_key);
            self.staged.by_external_key.insert(new_key, item.id);
        }
        if let Some(slot) = self.staged.work_items.get_mut(&item.id) {
            *slot = item.clone();
        }
        debug!(id = %item.id, version = item.version, "updated work item");
        Ok(item)
    }

    async fn delete_work_item(&mut self, id: Uuid) -> Result<(), StoreError> {
        let item = self
            .staged
            .work_items
            .remove(&id)
            .ok_or_else(|| StoreError::not_found("work item", id.to_string()))?;
        self.staged.by_external_key.remove(&item.remote.external_key());
        Ok(())
    }

    async fn list_work_items(
        &mut self,
        tracker_query_id: &str,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let mut items = self
            .staged
            .work_items
            .values()
            .filter(|item| item.remote.tracker_query_id == tracker_query_id)
            .cloned()
            .collect::<Vec<_>>();
        items.sort_by_key(|item| item.created_at);
        Ok(items)
    }
}

#[async_trait]
impl TrackerStore for InMemoryTx {
    async fn create_tracker(
        &mut self,
        url: &str,
        provider_type: &ProviderType,
    ) -> Result<Tracker, StoreError> {
        require_non_empty("url", url)?;
        self.staged.last_tracker_id += 1;
        let id = self.staged.last_tracker_id;
        let row = TrackerRow {
            url: url.trim().to_string(),
            provider_type: provider_type.clone(),
        };
        let tracker = tracker_from_row(id, &row);
        self.staged.trackers.insert(id, row);
        Ok(tracker)
    }

    async fn load_tracker(&mut self, id: &str) -> Result<Tracker, StoreError> {
        let key = parse_id("tracker", id)?;
        self.staged
            .trackers
            .get(&key)
            .map(|row| tracker_from_row(key, row))
            .ok_or_else(|| StoreError::not_found("tracker", id))
    }

    async fn save_tracker(&mut self, tracker: &Tracker) -> Result<Tracker, StoreError> {
        let key = parse_id("tracker", &tracker.id)?;
        require_non_empty("url", &tracker.url)?;
        let row = self
            .staged
            .trackers
            .get_mut(&key)
            .ok_or_else(|| StoreError::not_found("tracker", tracker.id.as_str()))?;
        row.url = tracker.url.trim().to_string();
        row.provider_type = tracker.provider_type.clone();
        Ok(tracker_from_row(key, row))
    }

    async fn delete_tracker(&mut self, id: &str) -> Result<(), StoreError> {
        let key = parse_id("tracker", id)?;
        if !self.staged.trackers.contains_key(&key) {
            return Err(StoreError::not_found("tracker", id));
        }
        if self
            .staged
            .tracker_queries
            .values()
            .any(|tq| tq.tracker_id == key)
        {
            return Err(StoreError::BadParameter {
                parameter: "tracker",
                reason: format!("tracker {id} is still referenced by tracker queries"),
            });
        }
        self.staged.trackers.remove(&key);
        Ok(())
    }

    async fn list_trackers(&mut self) -> Result<Vec<Tracker>, StoreError> {
        Ok(self
            .staged
            .trackers
            .iter()
            .map(|(id, row)| tracker_from_row(*id, row))
            .collect())
    }
}

#[async_trait]
impl TrackerQueryStore for InMemoryTx {
    async fn create_tracker_query(
        &mut self,
        query: &str,
        schedule: &str,
        tracker_id: &str,
    ) -> Result<TrackerQuery, StoreError> {
        let tracker_key = parse_id("tracker", tracker_id)?;
        if !self.staged.trackers.contains_key(&tracker_key) {
            return Err(StoreError::not_found("tracker", tracker_id));
        }
        self.staged.last_tracker_query_id += 1;
        let id = self.staged.last_tracker_query_id;
        let row = TrackerQueryRow {
            query: query.to_string(),
            schedule: schedule.to_string(),
            tracker_id: tracker_key,
        };
        let tq = tracker_query_from_row(id, &row);
        self.staged.tracker_queries.insert(id, row);
        Ok(tq)
    }

    async fn load_tracker_query(&mut self, id: &str) -> Result<TrackerQuery, StoreError> {
        let key = parse_id("tracker query", id)?;
        self.staged
            .tracker_queries
            .get(&key)
            .map(|row| tracker_query_from_row(key, row))
            .ok_or_else(|| StoreError::not_found("tracker query", id))
    }

    async fn save_tracker_query(
        &mut self,
        tracker_query: &TrackerQuery,
    ) -> Result<TrackerQuery, StoreError> {
        let key = parse_id("tracker query", &tracker_query.id)?;
        if !self.staged.tracker_queries.contains_key(&key) {
            return Err(StoreError::not_found("tracker query", tracker_query.id.as_str()));
        }
        let tracker_key = parse_id("tracker", &tracker_query.tracker_id)?;
        if !self.staged.trackers.contains_key(&tracker_key) {
            return Err(StoreError::not_found("tracker", tracker_query.tracker_id.as_str()));
        }
        let row = TrackerQueryRow {
            query: tracker_query.query.clone(),
            schedule: tracker_query.schedule.clone(),
            tracker_id: tracker_key,
        };
        let saved = tracker_query_from_row(key, &row);
        self.staged.tracker_queries.insert(key, row);
        Ok(saved)
    }

    async fn delete_tracker_query(&mut self, id: &str) -> Result<(), StoreError> {
        let key = parse_id("tracker query", id)?;
        self.staged
            .tracker_queries
            .remove(&key)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("tracker query", id))
    }

    async fn list_tracker_queries(&mut self) -> Result<Vec<TrackerQuery>, StoreError> {
        Ok(self
            .staged
            .tracker_queries
            .iter()
            .map(|(id, row)| tracker_query_from_row(*id, row))
            .collect())
    }
}
