//! Create-or-update of a single remote record.

use chrono::Utc;
use rwi_adapters::Normalizer;
use rwi_core::{
    ExternalKey, FieldMap, ProviderType, RemoteLink, RemoteRecord, Result, WorkItem, WorkItemError,
};
use rwi_storage::{sha256_hex, Lookup, StoreError, TrackerQueryStore, WorkItemStore};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Created,
    Updated,
}

/// Reconcile `record` into the work item keyed by
/// `(tracker_query_id, record.identifier)`, creating it on first sight.
///
/// All reads and the single write go through `store`; the caller owns the
/// transaction and rolls it back when this returns an error.
pub async fn convert<S>(
    store: &mut S,
    normalizer: &Normalizer,
    tracker_query_id: &str,
    record: &RemoteRecord,
    provider_type: &ProviderType,
) -> Result<WorkItem>
where
    S: WorkItemStore + TrackerQueryStore,
{
    reconcile(store, normalizer, tracker_query_id, record, provider_type)
        .await
        .map(|(item, _)| item)
}

/// Same as [`convert`], also reporting whether the item was created or updated.
pub async fn reconcile<S>(
    store: &mut S,
    normalizer: &Normalizer,
    tracker_query_id: &str,
    record: &RemoteRecord,
    provider_type: &ProviderType,
) -> Result<(WorkItem, ReconcileOutcome)>
where
    S: WorkItemStore + TrackerQueryStore,
{
    let tracker_query = store.load_tracker_query(tracker_query_id).await?;
    let fields = normalizer.normalize_and_map(provider_type, &record.payload)?;
    let link = RemoteLink {
        tracker_query_id: tracker_query.id,
        remote_item_id: record.identifier.clone(),
        provider_type: provider_type.clone(),
    };
    let key = link.external_key();
    let digest = sha256_hex(&record.payload);

    match store.find_by_external_key(&key).await? {
        Lookup::Found(existing) => {
            let item = apply_update(store, existing, fields, digest).await?;
            Ok((item, ReconcileOutcome::Updated))
        }
        Lookup::Missing => {
            let now = Utc::now();
            let candidate = WorkItem {
                id: Uuid::new_v4(),
                fields: fields.clone(),
                remote: link,
                version: 1,
                payload_sha256: digest.clone(),
                created_at: now,
                updated_at: now,
            };
            match store.create_work_item(candidate).await {
                Ok(created) => {
                    info!(id = %created.id, external_key = %key, "created work item");
                    Ok((created, ReconcileOutcome::Created))
                }
                Err(StoreError::DuplicateExternalKey(_)) => {
                    debug!(external_key = %key, "lost create race, retrying as update");
                    let existing = reload_after_conflict(store, &key).await?;
                    let item = apply_update(store, existing, fields, digest).await?;
                    Ok((item, ReconcileOutcome::Updated))
                }
                Err(err) => Err(err.into()),
            }
        }
    }
}

async fn reload_after_conflict<S>(store: &mut S, key: &ExternalKey) -> Result<WorkItem>
where
    S: WorkItemStore,
{
    match store.find_by_external_key(key).await? {
        Lookup::Found(item) => Ok(item),
        Lookup::Missing => Err(WorkItemError::internal(format!(
            "work item {key} reported as duplicate but could not be loaded"
        ))),
    }
}

async fn apply_update<S>(
    store: &mut S,
    mut item: WorkItem,
    fields: FieldMap,
    digest: String,
) -> Result<WorkItem>
where
    S: WorkItemStore,
{
    item.merge_fields(fields);
    item.version += 1;
    item.payload_sha256 = digest;
    item.updated_at = Utc::now();
    let updated = store.update_work_item(item).await?;
    info!(id = %updated.id, version = updated.version, "updated work item");
    Ok(updated)
}
