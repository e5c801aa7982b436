use std::path::{Path, PathBuf};
use std::sync::Arc;

use rwi_adapters::{Normalizer, SchemaRegistry};
use rwi_core::{CanonicalField, ProviderType};
use rwi_storage::{InMemoryBackend, StorageBackend, StorageTx, TrackerQueryStore, TrackerStore, WorkItemStore};
use rwi_sync::{build_scheduler, run_scheduled_import, BundleDirectorySource, Importer, SyncConfig};

fn bundles_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/bundles")
        .canonicalize()
        .expect("fixture bundles dir")
}

fn importer(backend: &InMemoryBackend) -> Importer<InMemoryBackend> {
    Importer::new(
        backend.clone(),
        Normalizer::new(Arc::new(SchemaRegistry::builtin())),
    )
}

async fn seed(backend: &InMemoryBackend, query: &str, schedule: &str) -> String {
    let mut tx = backend.begin().await.unwrap();
    let tracker = match tx.list_trackers().await.unwrap().into_iter().next() {
        Some(tracker) => tracker,
        None => tx
            .create_tracker("https://api.github.com/", &ProviderType::github())
            .await
            .unwrap(),
    };
    let tq = tx.create_tracker_query(query, schedule, &tracker.id).await.unwrap();
    tx.commit().await.unwrap();
    tq.id
}

fn config(scheduler_enabled: bool) -> SyncConfig {
    let mut config = SyncConfig::from_lookup(|_| None);
    config.bundles_dir = bundles_dir();
    config.scheduler_enabled = scheduler_enabled;
    config
}

#[tokio::test]
async fn scheduled_import_reconciles_fixture_bundle() {
    let backend = InMemoryBackend::new();
    let tq = seed(&backend, "repo:sbose/api is:issue", "0 0 * * * *").await;
    let importer = importer(&backend);
    let source = BundleDirectorySource::new(bundles_dir());

    let first = run_scheduled_import(&importer, &source, &tq).await.unwrap();
    assert_eq!((first.created, first.updated), (2, 0));
    assert!(first.failed.is_empty());

    let second = run_scheduled_import(&importer, &source, &tq).await.unwrap();
    assert_eq!((second.created, second.updated), (0, 2));

    let mut tx = backend.begin().await.unwrap();
    let items = tx.list_work_items(&tq).await.unwrap();
    assert_eq!(items.len(), 2);
    assert!(items.iter().all(|item| item.version == 2));
    assert!(items
        .iter()
        .any(|item| item.field_str(CanonicalField::Assignee) == Some("pranav")));
}

#[tokio::test]
async fn queries_without_matching_bundles_import_nothing() {
    let backend = InMemoryBackend::new();
    let tq = seed(&backend, "repo:someone/else", "0 0 * * * *").await;
    let source = BundleDirectorySource::new(bundles_dir());

    let summary = run_scheduled_import(&importer(&backend), &source, &tq).await.unwrap();
    assert_eq!(summary.total(), 0);
}

#[tokio::test]
async fn scheduled_import_of_missing_query_fails() {
    let backend = InMemoryBackend::new();
    let source = BundleDirectorySource::new(bundles_dir());
    assert!(run_scheduled_import(&importer(&backend), &source, "42").await.is_err());
}

#[tokio::test]
async fn scheduler_is_only_built_when_enabled() {
    let backend = InMemoryBackend::new();
    let valid = seed(&backend, "repo:sbose/api is:issue", "0 0 * * * *").await;
    seed(&backend, "repo:sbose/api is:pr", "not a schedule").await;
    let source = Arc::new(BundleDirectorySource::new(bundles_dir()));

    let disabled = build_scheduler(&config(false), importer(&backend), source.clone())
        .await
        .unwrap();
    assert!(disabled.is_none());

    let enabled = build_scheduler(&config(true), importer(&backend), source)
        .await
        .unwrap()
        .expect("scheduler");
    assert_eq!(enabled.scheduled_queries().await, vec![valid]);
}

#[tokio::test]
async fn queries_created_after_start_get_a_job() {
    let backend = InMemoryBackend::new();
    let scheduler = build_scheduler(
        &config(true),
        importer(&backend),
        Arc::new(BundleDirectorySource::new(bundles_dir())),
    )
    .await
    .unwrap()
    .expect("scheduler");
    scheduler.start().await.unwrap();
    assert!(scheduler.scheduled_queries().await.is_empty());

    let tq = seed(&backend, "repo:sbose/api is:issue", "* * * * * *").await;
    let mut tx = backend.begin().await.unwrap();
    let query = tx.load_tracker_query(&tq).await.unwrap();
    tx.rollback().await.unwrap();

    assert!(scheduler.schedule(&query).await.unwrap());
    assert_eq!(scheduler.scheduled_queries().await, vec![tq.clone()]);

    let mut broken = query.clone();
    broken.schedule = "every now and then".into();
    assert!(!scheduler.schedule(&broken).await.unwrap());
    assert!(scheduler.scheduled_queries().await.is_empty());

    scheduler.schedule(&query).await.unwrap();
    scheduler.unschedule(&tq).await.unwrap();
    assert!(scheduler.scheduled_queries().await.is_empty());
    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn resync_follows_query_changes_in_storage() {
    let backend = InMemoryBackend::new();
    let scheduler = build_scheduler(
        &config(true),
        importer(&backend),
        Arc::new(BundleDirectorySource::new(bundles_dir())),
    )
    .await
    .unwrap()
    .expect("scheduler");

    let first = seed(&backend, "repo:sbose/api is:issue", "0 0 * * * *").await;
    let second = seed(&backend, "repo:sbose/api is:pr", "0 30 * * * *").await;
    scheduler.resync().await.unwrap();
    assert_eq!(scheduler.scheduled_queries().await, vec![first.clone(), second.clone()]);

    let mut tx = backend.begin().await.unwrap();
    tx.delete_tracker_query(&first).await.unwrap();
    tx.commit().await.unwrap();
    scheduler.resync().await.unwrap();
    assert_eq!(scheduler.scheduled_queries().await, vec![second]);
}
