//! Cron-driven imports, one job per tracker query.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use rwi_core::{parse_numeric_id, TrackerQuery};
use rwi_storage::{StorageBackend, StorageTx, TrackerQueryStore, TrackerStore};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{ImportSummary, Importer, RemoteItemSource, SyncConfig};

/// Fetch the records for one tracker query from `source` and import them.
pub async fn run_scheduled_import<B, S>(
    importer: &Importer<B>,
    source: &S,
    tracker_query_id: &str,
) -> Result<ImportSummary>
where
    B: StorageBackend,
    S: RemoteItemSource + ?Sized,
{
    let mut tx = importer.backend().begin().await?;
    let query = tx.load_tracker_query(tracker_query_id).await?;
    let tracker = tx.load_tracker(&query.tracker_id).await?;
    tx.rollback().await?;

    let records = source
        .fetch(&tracker, &query)
        .await
        .with_context(|| format!("fetching records for tracker query {}", query.id))?;
    let summary = importer
        .import_batch(&query.id, &tracker.provider_type, records)
        .await
        .with_context(|| format!("importing records for tracker query {}", query.id))?;
    Ok(summary)
}

/// Keeps exactly one cron job per tracker query. Callers report query
/// changes through [`schedule`](Self::schedule) and
/// [`unschedule`](Self::unschedule), or re-read the whole list with
/// [`resync`](Self::resync).
pub struct QueryScheduler<B> {
    sched: JobScheduler,
    importer: Importer<B>,
    source: Arc<dyn RemoteItemSource>,
    jobs: Mutex<HashMap<String, ScheduledJob>>,
}

struct ScheduledJob {
    schedule: String,
    job_id: Uuid,
}

impl<B: StorageBackend> QueryScheduler<B> {
    pub async fn new(importer: Importer<B>, source: Arc<dyn RemoteItemSource>) -> Result<Self> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        Ok(Self {
            sched,
            importer,
            source,
            jobs: Mutex::new(HashMap::new()),
        })
    }

    pub fn scheduler(&self) -> &JobScheduler {
        &self.sched
    }

    pub async fn start(&self) -> Result<()> {
        self.sched.start().await.context("starting scheduler")
    }

    pub async fn shutdown(&self) -> Result<()> {
        let mut sched = self.sched.clone();
        sched.shutdown().await.context("stopping scheduler")
    }

    /// Ids of the tracker queries that currently have a job, sorted.
    pub async fn scheduled_queries(&self) -> Vec<String> {
        let mut ids = self.jobs.lock().await.keys().cloned().collect::<Vec<_>>();
        ids.sort();
        ids
    }

    /// Make the job of `query` follow its current schedule. Returns `false`
    /// when the schedule does not parse; the query is then left without a job.
    pub async fn schedule(&self, query: &TrackerQuery) -> Result<bool> {
        let mut jobs = self.jobs.lock().await;
        if jobs.get(&query.id).is_some_and(|job| job.schedule == query.schedule) {
            return Ok(true);
        }
        if let Some(old) = jobs.remove(&query.id) {
            self.sched
                .remove(&old.job_id)
                .await
                .with_context(|| format!("removing job of tracker query {}", query.id))?;
        }
        let job = match self.job_for(&query.id, &query.schedule) {
            Ok(job) => job,
            Err(err) => {
                warn!(
                    tracker_query_id = query.id.as_str(),
                    schedule = query.schedule.as_str(),
                    error = %err,
                    "tracker query has an invalid schedule; not scheduled"
                );
                return Ok(false);
            }
        };
        let job_id = self
            .sched
            .add(job)
            .await
            .with_context(|| format!("adding scheduler job for tracker query {}", query.id))?;
        jobs.insert(
            query.id.clone(),
            ScheduledJob {
                schedule: query.schedule.clone(),
                job_id,
            },
        );
        info!(tracker_query_id = query.id.as_str(), schedule = query.schedule.as_str(), "scheduled tracker query");
        Ok(true)
    }

    pub async fn unschedule(&self, tracker_query_id: &str) -> Result<()> {
        let key = parse_numeric_id("tracker query", tracker_query_id)
            .map(|id| id.to_string())
            .unwrap_or_else(|_| tracker_query_id.to_string());
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.remove(&key) {
            self.sched
                .remove(&job.job_id)
                .await
                .with_context(|| format!("removing job of tracker query {key}"))?;
            info!(tracker_query_id = key.as_str(), "unscheduled tracker query");
        }
        Ok(())
    }

    /// Re-read every tracker query: new and changed ones are (re)scheduled,
    /// deleted ones lose their job.
    pub async fn resync(&self) -> Result<()> {
        let mut tx = self.importer.backend().begin().await?;
        let queries = tx.list_tracker_queries().await?;
        tx.rollback().await?;

        let stale = {
            let jobs = self.jobs.lock().await;
            jobs.keys()
                .filter(|id| !queries.iter().any(|q| &q.id == *id))
                .cloned()
                .collect::<Vec<_>>()
        };
        for id in stale {
            self.unschedule(&id).await?;
        }
        for query in &queries {
            self.schedule(query).await?;
        }
        Ok(())
    }

    fn job_for(&self, tracker_query_id: &str, schedule: &str) -> Result<Job, JobSchedulerError> {
        let importer = self.importer.clone();
        let source = Arc::clone(&self.source);
        let tracker_query_id = tracker_query_id.to_string();
        Job::new_async(schedule, move |_uuid, _l| {
            let importer = importer.clone();
            let source = Arc::clone(&source);
            let tracker_query_id = tracker_query_id.clone();
            Box::pin(async move {
                match run_scheduled_import(&importer, source.as_ref(), &tracker_query_id).await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        tracker_query_id = tracker_query_id.as_str(),
                        created = summary.created,
                        updated = summary.updated,
                        failed = summary.failed.len(),
                        "scheduled import finished"
                    ),
                    Err(err) => error!(
                        tracker_query_id = tracker_query_id.as_str(),
                        error = %format!("{err:#}"),
                        "scheduled import failed"
                    ),
                }
            })
        })
    }
}

/// Scheduler with a job for every tracker query that exists now, or `None`
/// when scheduling is disabled.
pub async fn build_scheduler<B: StorageBackend>(
    config: &SyncConfig,
    importer: Importer<B>,
    source: Arc<dyn RemoteItemSource>,
) -> Result<Option<QueryScheduler<B>>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    let scheduler = QueryScheduler::new(importer, source).await?;
    scheduler.resync().await?;
    Ok(Some(scheduler))
}
