//! Postgres backend built on sqlx.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rwi_core::{ExternalKey, ProviderType, RemoteLink, Tracker, TrackerQuery, WorkItem};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Acquire, FromRow, PgPool, Postgres, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    parse_id, require_non_empty, Lookup, StorageBackend, StorageTx, StoreError, TrackerQueryStore,
    TrackerStore, WorkItemStore,
};

const WORK_ITEM_COLUMNS: &str = "id, tracker_query_id, remote_item_id, provider_type, fields, \
                                 version, payload_sha256, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")?;
        info!("database migrations applied");
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for PgBackend {
    type Tx = PgTx;

    async fn begin(&self) -> Result<PgTx, StoreError> {
        Ok(PgTx {
            tx: self.pool.begin().await?,
        })
    }
}

pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StorageTx for PgTx {
    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db| db.is_foreign_key_violation())
}

#[derive(Debug, FromRow)]
struct WorkItemRow {
    id: Uuid,
    tracker_query_id: String,
    remote_item_id: String,
    provider_type: String,
    fields: serde_json::Value,
    version: i64,
    payload_sha256: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<WorkItemRow> for WorkItem {
    type Error = StoreError;

    fn try_from(row: WorkItemRow) -> Result<Self, StoreError> {
        Ok(WorkItem {
            id: row.id,
            fields: serde_json::from_value(row.fields)?,
            remote: RemoteLink {
                tracker_query_id: row.tracker_query_id,
                remote_item_id: row.remote_item_id,
                provider_type: ProviderType::new(row.provider_type),
            },
            version: row.version,
            payload_sha256: row.payload_sha256,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct TrackerRow {
    id: i64,
    url: String,
    provider_type: String,
}

impl From<TrackerRow> for Tracker {
    fn from(row: TrackerRow) -> Self {
        Tracker {
            id: row.id.to_string(),
            url: row.url,
            provider_type: ProviderType::new(row.provider_type),
        }
    }
}

#[derive(Debug, FromRow)]
struct TrackerQueryRow {
    id: i64,
    query: String,
    schedule: String,
    tracker_id: i64,
}

impl From<TrackerQueryRow> for TrackerQuery {
    fn from(row: TrackerQueryRow) -> Self {
        TrackerQuery {
            id: row.id.to_string(),
            query: row.query,
            schedule: row.schedule,
            tracker_id: row.tracker_id.to_string(),
        }
    }
}

impl PgTx {
    async fn tracker_exists(&mut self, id: i64) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM trackers WHERE id = $1)")
            .bind(id)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(exists)
    }
}

#[async_trait]
impl WorkItemStore for PgTx {
    async fn find_by_external_key(
        &mut self,
        key: &ExternalKey,
    ) -> Result<Lookup<WorkItem>, StoreError> {
        let row = sqlx::query_as::<_, WorkItemRow>(&format!(
            "SELECT {WORK_ITEM_COLUMNS} FROM work_items \
             WHERE tracker_query_id = $1 AND remote_item_id = $2 FOR UPDATE"
        ))
        .bind(&key.tracker_query_id)
        .bind(&key.remote_item_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        match row {
            Some(row) => Ok(Lookup::Found(row.try_into()?)),
            None => Ok(Lookup::Missing),
        }
    }

    async fn load_work_item(&mut self, id: Uuid) -> Result<WorkItem, StoreError> {
        let row = sqlx::query_as::<_, WorkItemRow>(&format!(
            "SELECT {WORK_ITEM_COLUMNS} FROM work_items WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| StoreError::not_found("work item", id.to_string()))?;
        row.try_into()
    }

    async fn create_work_item(&mut self, item: WorkItem) -> Result<WorkItem, StoreError> {
        let fields = serde_json::to_value(&item.fields)?;
        // Savepoint: a unique violation must not abort the outer transaction.
        let mut savepoint = Acquire::begin(&mut *self.tx).await?;
        let inserted = sqlx::query(
            "INSERT INTO work_items \
             (id, tracker_query_id, remote_item_id, provider_type, fields, version, payload_sha256, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(item.id)
        .bind(&item.remote.tracker_query_id)
        .bind(&item.remote.remote_item_id)
        .bind(item.remote.provider_type.as_str())
        .bind(fields)
        .bind(item.version)
        .bind(&item.payload_sha256)
        .bind(item.created_at)
        .bind(item.updated_at)
        .execute(&mut *savepoint)
        .await;

        match inserted {
            Ok(_) => {
                savepoint.commit().await?;
                debug!(id = %item.id, "created work item");
                Ok(item)
            }
            Err(err) if is_unique_violation(&err) => {
                savepoint.rollback().await?;
                Err(StoreError::DuplicateExternalKey(item.remote.external_key()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn update_work_item(&mut self, item: WorkItem) -> Result<WorkItem, StoreError> {
        let fields = serde_json::to_value(&item.fields)?;
        let result = sqlx::query(
            "UPDATE work_items \
                SET tracker_query_id = $2, remote_item_id = $3, provider_type = $4, fields = $5, \
                    version = $6, payload_sha256 = $7, updated_at = $8 \
              WHERE id = $1",
        )
        .bind(item.id)
        .bind(&item.remote.tracker_query_id)
        .bind(&item.remote.remote_item_id)
        .bind(item.remote.provider_type.as_str())
        .bind(fields)
        .bind(item.version)
        .bind(&item.payload_sha256)
        .bind(item.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                StoreError::DuplicateExternalKey(item.remote.external_key())
            } else {
                err.into()
            }
        })?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("work item", item.id.to_string()));
        }
        debug!(id = %item.id, version = item.version, "updated work item");
        Ok(item)
    }

    async fn delete_work_item(&mut self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM work_items WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("work item", id.to_string()));
        }
        Ok(())
    }

    async fn list_work_items(
        &mut self,
        tracker_query_id: &str,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let rows = sqlx::query_as::<_, WorkItemRow>(&format!(
            "SELECT {WORK_ITEM_COLUMNS} FROM work_items \
             WHERE tracker_query_id = $1 ORDER BY created_at"
        ))
        .bind(tracker_query_id)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.into_iter().map(WorkItem::try_from).collect()
    }
}

#[async_trait]
impl TrackerStore for PgTx {
    async fn create_tracker(
        &mut self,
        url: &str,
        provider_type: &ProviderType,
    ) -> Result<Tracker, StoreError> {
        require_non_empty("url", url)?;
        let row = sqlx::query_as::<_, TrackerRow>(
            "INSERT INTO trackers (url, provider_type) VALUES ($1, $2) \
             RETURNING id, url, provider_type",
        )
        .bind(url.trim())
        .bind(provider_type.as_str())
        .fetch_one(&mut *self.tx)
        .await?;
        info!(tracker_id = row.id, "created tracker");
        Ok(row.into())
    }

    async fn load_tracker(&mut self, id: &str) -> Result<Tracker, StoreError> {
        let key = parse_id("tracker", id)?;
        sqlx::query_as::<_, TrackerRow>("SELECT id, url, provider_type FROM trackers WHERE id = $1")
            .bind(key)
            .fetch_optional(&mut *self.tx)
            .await?
            .map(Tracker::from)
            .ok_or_else(|| StoreError::not_found("tracker", id))
    }

    async fn save_tracker(&mut self, tracker: &Tracker) -> Result<Tracker, StoreError> {
        let key = parse_id("tracker", &tracker.id)?;
        require_non_empty("url", &tracker.url)?;
        sqlx::query_as::<_, TrackerRow>(
            "UPDATE trackers SET url = $2, provider_type = $3, updated_at = NOW() \
             WHERE id = $1 RETURNING id, url, provider_type",
        )
        .bind(key)
        .bind(tracker.url.trim())
        .bind(tracker.provider_type.as_str())
        .fetch_optional(&mut *self.tx)
        .await?
        .map(Tracker::from)
        .ok_or_else(|| StoreError::not_found("tracker", tracker.id.as_str()))
    }

    async fn delete_tracker(&mut self, id: &str) -> Result<(), StoreError> {
        let key = parse_id("tracker", id)?;
        let mut savepoint = Acquire::begin(&mut *self.tx).await?;
        let deleted = sqlx::query("DELETE FROM trackers WHERE id = $1")
            .bind(key)
            .execute(&mut *savepoint)
            .await;
        match deleted {
            Ok(result) if result.rows_affected() == 0 => {
                savepoint.rollback().await?;
                Err(StoreError::not_found("tracker", id))
            }
            Ok(_) => {
                savepoint.commit().await?;
                Ok(())
            }
            Err(err) if is_foreign_key_violation(&err) => {
                savepoint.rollback().await?;
                Err(StoreError::BadParameter {
                    parameter: "tracker",
                    reason: format!("tracker {id} is still referenced by tracker queries"),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn list_trackers(&mut self) -> Result<Vec<Tracker>, StoreError> {
        let rows = sqlx::query_as::<_, TrackerRow>(
            "SELECT id, url, provider_type FROM trackers ORDER BY id",
        )
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows.into_iter().map(Tracker::from).collect())
    }
}

#[async_trait]
impl TrackerQueryStore for PgTx {
    async fn create_tracker_query(
        &mut self,
        query: &str,
        schedule: &str,
        tracker_id: &str,
    ) -> Result<TrackerQuery, StoreError> {
        let tracker_key = parse_id("tracker", tracker_id)?;
        if !self.tracker_exists(tracker_key).await? {
            return Err(StoreError::not_found("tracker", tracker_id));
        }
        let row = sqlx::query_as::<_, TrackerQueryRow>(
            "INSERT INTO tracker_queries (query, schedule, tracker_id) VALUES ($1, $2, $3) \
             RETURNING id, query, schedule, tracker_id",
        )
        .bind(query)
        .bind(schedule)
        .bind(tracker_key)
        .fetch_one(&mut *self.tx)
        .await?;
        info!(tracker_query_id = row.id, tracker_id = tracker_key, "created tracker query");
        Ok(row.into())
    }

    async fn load_tracker_query(&mut self, id: &str) -> Result<TrackerQuery, StoreError> {
        let key = parse_id("tracker query", id)?;
        debug!(tracker_query_id = key, "loading tracker query");
        sqlx::query_as::<_, TrackerQueryRow>(
            "SELECT id, query, schedule, tracker_id FROM tracker_queries WHERE id = $1",
        )
        .bind(key)
        .fetch_optional(&mut *self.tx)
        .await?
        .map(TrackerQuery::from)
        .ok_or_else(|| StoreError::not_found("tracker query", id))
    }

    async fn save_tracker_query(
        &mut self,
        tracker_query: &TrackerQuery,
    ) -> Result<TrackerQuery, StoreError> {
        let key = parse_id("tracker query", &tracker_query.id)?;
        let query_exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM tracker_queries WHERE id = $1)")
                .bind(key)
                .fetch_one(&mut *self.tx)
                .await?;
        if !query_exists {
            return Err(StoreError::not_found("tracker query", tracker_query.id.as_str()));
        }
        let tracker_key = parse_id("tracker", &tracker_query.tracker_id)?;
        if !self.tracker_exists(tracker_key).await? {
            return Err(StoreError::not_found("tracker", tracker_query.tracker_id.as_str()));
        }
        let row = sqlx::query_as::<_, TrackerQueryRow>(
            "UPDATE tracker_queries SET query = $2, schedule = $3, tracker_id = $4, updated_at = NOW() \
             WHERE id = $1 RETURNING id, query, schedule, tracker_id",
        )
        .bind(key)
        .bind(&tracker_query.query)
        .bind(&tracker_query.schedule)
        .bind(tracker_key)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| StoreError::not_found("tracker query", tracker_query.id.as_str()))?;
        info!(tracker_query_id = key, "updated tracker query");
        Ok(row.into())
    }

    async fn delete_tracker_query(&mut self, id: &str) -> Result<(), StoreError> {
        let key = parse_id("tracker query", id)?;
        let result = sqlx::query("DELETE FROM tracker_queries WHERE id = $1")
            .bind(key)
            .execute(&mut *self.tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("tracker query", id));
        }
        Ok(())
    }

    async fn list_tracker_queries(&mut self) -> Result<Vec<TrackerQuery>, StoreError> {
        let rows = sqlx::query_as::<_, TrackerQueryRow>(
            "SELECT id, query, schedule, tracker_id FROM tracker_queries ORDER BY id",
        )
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows.into_iter().map(TrackerQuery::from).collect())
    }
}
