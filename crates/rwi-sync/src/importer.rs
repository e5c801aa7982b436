//! Transaction-per-record imports with bounded concurrency.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rwi_adapters::Normalizer;
use rwi_core::{ProviderType, RemoteRecord, Result, WorkItem, WorkItemError};
use rwi_storage::{StorageBackend, StorageTx, TrackerQueryStore};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::{reconcile, ReconcileOutcome};

pub const DEFAULT_IMPORT_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Serialize)]
pub struct ImportFailure {
    pub identifier: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub run_id: Uuid,
    pub tracker_query_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub created: usize,
    pub updated: usize,
    pub failed: Vec<ImportFailure>,
}

impl ImportSummary {
    pub fn total(&self) -> usize {
        self.created + self.updated + self.failed.len()
    }
}

#[derive(Debug, Clone)]
pub struct Importer<B> {
    backend: B,
    normalizer: Normalizer,
    concurrency: usize,
}

impl<B: StorageBackend> Importer<B> {
    pub fn new(backend: B, normalizer: Normalizer) -> Self {
        Self {
            backend,
            normalizer,
            concurrency: DEFAULT_IMPORT_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    /// Reconcile one record in its own transaction, committed on success and
    /// rolled back on any error.
    pub async fn import_one(
        &self,
        tracker_query_id: &str,
        provider_type: &ProviderType,
        record: &RemoteRecord,
    ) -> Result<(WorkItem, ReconcileOutcome)> {
        let mut tx = self.backend.begin().await?;
        match reconcile(&mut tx, &self.normalizer, tracker_query_id, record, provider_type).await {
            Ok(done) => {
                tx.commit().await?;
                Ok(done)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rollback after failed import");
                }
                Err(err)
            }
        }
    }

    /// Import every record, at most `concurrency` at a time. Per-record
    /// failures are collected in the summary; only an unknown tracker query
    /// fails the whole batch.
    pub async fn import_batch(
        &self,
        tracker_query_id: &str,
        provider_type: &ProviderType,
        records: Vec<RemoteRecord>,
    ) -> Result<ImportSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let tracker_query_id = self.resolve_tracker_query(tracker_query_id).await?;

        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        for (index, record) in records.into_iter().enumerate() {
            let importer = self.clone();
            let permits = Arc::clone(&permits);
            let tracker_query_id = tracker_query_id.clone();
            let provider_type = provider_type.clone();
            tasks.spawn(async move {
                let outcome = match permits.acquire_owned().await {
                    Ok(_permit) => importer
                        .import_one(&tracker_query_id, &provider_type, &record)
                        .await
                        .map(|(_, outcome)| outcome),
                    Err(closed) => Err(WorkItemError::internal(closed)),
                };
                (index, record.identifier, outcome)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            results.push(joined.map_err(WorkItemError::internal)?);
        }
        results.sort_by_key(|(index, _, _)| *index);

        let mut created = 0usize;
        let mut updated = 0usize;
        let mut failed = Vec::new();
        for (_, identifier, outcome) in results {
            match outcome {
                Ok(ReconcileOutcome::Created) => created += 1,
                Ok(ReconcileOutcome::Updated) => updated += 1,
                Err(err) => {
                    warn!(%run_id, identifier = identifier.as_str(), error = %err, "record import failed");
                    failed.push(ImportFailure {
                        identifier,
                        error: err.to_string(),
                    });
                }
            }
        }

        let summary = ImportSummary {
            run_id,
            tracker_query_id,
            started_at,
            finished_at: Utc::now(),
            created,
            updated,
            failed,
        };
        info!(
            %run_id,
            tracker_query_id = summary.tracker_query_id.as_str(),
            created = summary.created,
            updated = summary.updated,
            failed = summary.failed.len(),
            "import batch finished"
        );
        Ok(summary)
    }

    async fn resolve_tracker_query(&self, tracker_query_id: &str) -> Result<String> {
        let mut tx = self.backend.begin().await?;
        let loaded = tx.load_tracker_query(tracker_query_id).await;
        tx.rollback().await?;
        Ok(loaded?.id)
    }
}
