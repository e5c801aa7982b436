//! JSON API over trackers, tracker queries and reconciled work items.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rwi_adapters::SchemaRegistry;
use rwi_core::{ProviderType, RemoteRecord, Tracker, TrackerQuery, WorkItem, WorkItemError};
use rwi_storage::{StorageBackend, StorageTx, StoreError, TrackerQueryStore, TrackerStore, WorkItemStore};
use rwi_sync::{ImportSummary, Importer, QueryScheduler};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rwi-web";

pub struct AppState<B> {
    pub importer: Importer<B>,
    pub scheduler: Option<Arc<QueryScheduler<B>>>,
}

impl<B: StorageBackend> AppState<B> {
    pub fn new(importer: Importer<B>) -> Self {
        Self {
            importer,
            scheduler: None,
        }
    }

    /// Keep `scheduler` in step with tracker query writes made through the API.
    pub fn with_scheduler(mut self, scheduler: Arc<QueryScheduler<B>>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    async fn reschedule(&self, query: &TrackerQuery) {
        if let Some(scheduler) = &self.scheduler {
            if let Err(err) = scheduler.schedule(query).await {
                warn!(tracker_query_id = query.id.as_str(), error = %format!("{err:#}"), "rescheduling failed");
            }
        }
    }

    async fn unschedule(&self, tracker_query_id: &str) {
        if let Some(scheduler) = &self.scheduler {
            if let Err(err) = scheduler.unschedule(tracker_query_id).await {
                warn!(tracker_query_id, error = %format!("{err:#}"), "unscheduling failed");
            }
        }
    }

    fn backend(&self) -> &B {
        self.importer.backend()
    }

    fn registry(&self) -> &SchemaRegistry {
        self.importer.normalizer().registry()
    }
}

type SharedState<B> = State<Arc<AppState<B>>>;

pub fn app<B: StorageBackend>(state: AppState<B>) -> Router {
    Router::new()
        .route("/api/trackers", get(list_trackers::<B>).post(create_tracker::<B>))
        .route(
            "/api/trackers/{id}",
            get(show_tracker::<B>)
                .put(update_tracker::<B>)
                .delete(delete_tracker::<B>),
        )
        .route(
            "/api/trackerqueries",
            get(list_tracker_queries::<B>).post(create_tracker_query::<B>),
        )
        .route(
            "/api/trackerqueries/{id}",
            get(show_tracker_query::<B>)
                .put(update_tracker_query::<B>)
                .delete(delete_tracker_query::<B>),
        )
        .route("/api/trackerqueries/{id}/import", post(import_records::<B>))
        .route("/api/trackerqueries/{id}/workitems", get(list_work_items::<B>))
        .route(
            "/api/workitems/{id}",
            get(show_work_item::<B>).delete(delete_work_item::<B>),
        )
        .with_state(Arc::new(state))
}

pub async fn serve<B: StorageBackend>(port: u16, state: AppState<B>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving work item API");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Error body: `{"kind": "...", "error": "..."}`.
#[derive(Debug)]
pub struct ApiError(WorkItemError);

#[derive(Serialize)]
struct ErrorBody {
    kind: &'static str,
    error: String,
}

impl From<WorkItemError> for ApiError {
    fn from(err: WorkItemError) -> Self {
        ApiError(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self.0 {
            WorkItemError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            WorkItemError::BadParameter { .. } => (StatusCode::BAD_REQUEST, "bad_parameter"),
            WorkItemError::MalformedPayload(_) => (StatusCode::BAD_REQUEST, "malformed_payload"),
            WorkItemError::UnknownProvider(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "unknown_provider")
            }
            WorkItemError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        }
        let body = ErrorBody {
            kind,
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
struct TrackerInput {
    url: String,
    provider_type: ProviderType,
}

#[derive(Debug, Deserialize)]
struct TrackerQueryInput {
    query: String,
    schedule: String,
    tracker_id: String,
}

#[derive(Debug, Deserialize)]
struct ImportInput {
    /// Defaults to the provider of the query's tracker.
    #[serde(default)]
    provider_type: Option<ProviderType>,
    records: Vec<ImportRecord>,
}

#[derive(Debug, Deserialize)]
struct ImportRecord {
    identifier: String,
    /// A JSON document, or a string holding the raw payload text.
    payload: JsonValue,
}

impl ImportRecord {
    fn into_remote_record(self, provider_type: &ProviderType) -> Result<RemoteRecord, WorkItemError> {
        let payload = match self.payload {
            JsonValue::String(raw) => raw.into_bytes(),
            other => serde_json::to_vec(&other).map_err(WorkItemError::internal)?,
        };
        Ok(RemoteRecord::new(self.identifier, payload, provider_type.clone()))
    }
}

async fn list_trackers<B: StorageBackend>(State(state): SharedState<B>) -> ApiResult<Json<Vec<Tracker>>> {
    let mut tx = state.backend().begin().await?;
    let trackers = tx.list_trackers().await?;
    tx.rollback().await?;
    Ok(Json(trackers))
}

async fn create_tracker<B: StorageBackend>(
    State(state): SharedState<B>,
    Json(input): Json<TrackerInput>,
) -> ApiResult<(StatusCode, Json<Tracker>)> {
    let mut tx = state.backend().begin().await?;
    let tracker =
        rwi_sync::create_tracker(&mut tx, state.registry(), &input.url, &input.provider_type).await?;
    tx.commit().await?;
    Ok((StatusCode::CREATED, Json(tracker)))
}

async fn show_tracker<B: StorageBackend>(
    State(state): SharedState<B>,
    Path(id): Path<String>,
) -> ApiResult<Json<Tracker>> {
    let mut tx = state.backend().begin().await?;
    let tracker = tx.load_tracker(&id).await?;
    tx.rollback().await?;
    Ok(Json(tracker))
}

async fn update_tracker<B: StorageBackend>(
    State(state): SharedState<B>,
    Path(id): Path<String>,
    Json(input): Json<TrackerInput>,
) -> ApiResult<Json<Tracker>> {
    let tracker = Tracker {
        id,
        url: input.url,
        provider_type: input.provider_type,
    };
    let mut tx = state.backend().begin().await?;
    let saved = rwi_sync::save_tracker(&mut tx, state.registry(), &tracker).await?;
    tx.commit().await?;
    Ok(Json(saved))
}

async fn delete_tracker<B: StorageBackend>(
    State(state): SharedState<B>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let mut tx = state.backend().begin().await?;
    tx.delete_tracker(&id).await?;
    tx.commit().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_tracker_queries<B: StorageBackend>(
    State(state): SharedState<B>,
) -> ApiResult<Json<Vec<TrackerQuery>>> {
    let mut tx = state.backend().begin().await?;
    let queries = tx.list_tracker_queries().await?;
    tx.rollback().await?;
    Ok(Json(queries))
}

async fn create_tracker_query<B: StorageBackend>(
    State(state): SharedState<B>,
    Json(input): Json<TrackerQueryInput>,
) -> ApiResult<(StatusCode, Json<TrackerQuery>)> {
    let mut tx = state.backend().begin().await?;
    let created = tx
        .create_tracker_query(&input.query, &input.schedule, &input.tracker_id)
        .await?;
    tx.commit().await?;
    state.reschedule(&created).await;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn show_tracker_query<B: StorageBackend>(
    State(state): SharedState<B>,
    Path(id): Path<String>,
) -> ApiResult<Json<TrackerQuery>> {
    let mut tx = state.backend().begin().await?;
    let query = tx.load_tracker_query(&id).await?;
    tx.rollback().await?;
    Ok(Json(query))
}

async fn update_tracker_query<B: StorageBackend>(
    State(state): SharedState<B>,
    Path(id): Path<String>,
    Json(input): Json<TrackerQueryInput>,
) -> ApiResult<Json<TrackerQuery>> {
    let query = TrackerQuery {
        id,
        query: input.query,
        schedule: input.schedule,
        tracker_id: input.tracker_id,
    };
    let mut tx = state.backend().begin().await?;
    let saved = tx.save_tracker_query(&query).await?;
    tx.commit().await?;
    state.reschedule(&saved).await;
    Ok(Json(saved))
}

async fn delete_tracker_query<B: StorageBackend>(
    State(state): SharedState<B>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let mut tx = state.backend().begin().await?;
    tx.delete_tracker_query(&id).await?;
    tx.commit().await?;
    state.unschedule(&id).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn import_records<B: StorageBackend>(
    State(state): SharedState<B>,
    Path(id): Path<String>,
    Json(input): Json<ImportInput>,
) -> ApiResult<Json<ImportSummary>> {
    let provider_type = match input.provider_type {
        Some(provider_type) => provider_type,
        None => {
            let mut tx = state.backend().begin().await?;
            let query = tx.load_tracker_query(&id).await?;
            let tracker = tx.load_tracker(&query.tracker_id).await?;
            tx.rollback().await?;
            tracker.provider_type
        }
    };
    let records = input
        .records
        .into_iter()
        .map(|record| record.into_remote_record(&provider_type))
        .collect::<Result<Vec<_>, _>>()?;
    let summary = state
        .importer
        .import_batch(&id, &provider_type, records)
        .await?;
    Ok(Json(summary))
}

async fn list_work_items<B: StorageBackend>(
    State(state): SharedState<B>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<WorkItem>>> {
    let mut tx = state.backend().begin().await?;
    let query = tx.load_tracker_query(&id).await?;
    let items = tx.list_work_items(&query.id).await?;
    tx.rollback().await?;
    Ok(Json(items))
}

fn parse_work_item_id(raw: &str) -> Result<Uuid, WorkItemError> {
    Uuid::parse_str(raw.trim()).map_err(|_| WorkItemError::not_found("work item", raw))
}

async fn show_work_item<B: StorageBackend>(
    State(state): SharedState<B>,
    Path(id): Path<String>,
) -> ApiResult<Json<WorkItem>> {
    let id = parse_work_item_id(&id)?;
    let mut tx = state.backend().begin().await?;
    let item = tx.load_work_item(id).await?;
    tx.rollback().await?;
    Ok(Json(item))
}

async fn delete_work_item<B: StorageBackend>(
    State(state): SharedState<B>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let id = parse_work_item_id(&id)?;
    let mut tx = state.backend().begin().await?;
    tx.delete_work_item(id).await?;
    tx.commit().await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use rwi_adapters::Normalizer;
    use rwi_storage::InMemoryBackend;
    use rwi_sync::BundleDirectorySource;
    use serde_json::json;
    use tower::ServiceExt;

    fn test_importer() -> Importer<InMemoryBackend> {
        let normalizer = Normalizer::new(Arc::new(SchemaRegistry::builtin()));
        Importer::new(InMemoryBackend::new(), normalizer)
    }

    fn test_app() -> Router {
        app(AppState::new(test_importer()))
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<JsonValue>) -> (StatusCode, JsonValue) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let resp = app.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            JsonValue::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    async fn seed(app: &Router) -> String {
        let (status, tracker) = send(
            app,
            "POST",
            "/api/trackers",
            Some(json!({"url": "https://api.github.com/", "provider_type": "github"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, query) = send(
            app,
            "POST",
            "/api/trackerqueries",
            Some(json!({"query": "is:open", "schedule": "0 0 * * * *", "tracker_id": tracker["id"]})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        query["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn tracker_crud_round_trip() {
        let app = test_app();
        let (status, created) = send(
            &app,
            "POST",
            "/api/trackers",
            Some(json!({"url": "https://api.github.com/", "provider_type": "GitHub"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["provider_type"], "github");
        let id = created["id"].as_str().unwrap().to_string();

        let (status, updated) = send(
            &app,
            "PUT",
            &format!("/api/trackers/{id}"),
            Some(json!({"url": "https://issues.example.org/", "provider_type": "jira"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["url"], "https://issues.example.org/");

        let (status, listed) = send(&app, "GET", "/api/trackers", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let (status, _) = send(&app, "DELETE", &format!("/api/trackers/{id}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, body) = send(&app, "GET", &format!("/api/trackers/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "not_found");
    }

    #[tokio::test]
    async fn invalid_tracker_input_is_a_bad_request() {
        let app = test_app();
        let (status, body) = send(
            &app,
            "POST",
            "/api/trackers",
            Some(json!({"url": "https://gitlab.com/", "provider_type": "gitlab"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "bad_parameter");

        let (status, _) = send(
            &app,
            "POST",
            "/api/trackers",
            Some(json!({"url": " ", "provider_type": "github"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn non_numeric_ids_are_not_found() {
        let app = test_app();
        for uri in [
            "/api/trackers/does-not-exist",
            "/api/trackerqueries/does-not-exist",
            "/api/workitems/does-not-exist",
        ] {
            let (status, _) = send(&app, "GET", uri, None).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
        }
    }

    #[tokio::test]
    async fn import_creates_then_updates_work_items() {
        let app = test_app();
        let tq = seed(&app).await;
        let import = |title: &str| {
            json!({
                "records": [{
                    "identifier": "http://github.com/sbose/api/testonly/1",
                    "payload": {"title": title, "state": "open", "user": {"login": "sbose78"}}
                }]
            })
        };

        let (status, first) = send(&app, "POST", &format!("/api/trackerqueries/{tq}/import"), Some(import("linking"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["created"], 1);

        let (status, second) = send(
            &app,
            "POST",
            &format!("/api/trackerqueries/{tq}/import"),
            Some(import("linking-updated")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second["updated"], 1);

        let (_, items) = send(&app, "GET", &format!("/api/trackerqueries/{tq}/workitems"), None).await;
        let items = items.as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["fields"]["system.title"], "linking-updated");
        assert_eq!(items[0]["fields"]["system.creator"], "sbose78");

        let id = items[0]["id"].as_str().unwrap();
        let (status, item) = send(&app, "GET", &format!("/api/workitems/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(item["version"], 2);

        let (status, _) = send(&app, "DELETE", &format!("/api/workitems/{id}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, "GET", &format!("/api/workitems/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn import_reports_malformed_records_and_unknown_queries() {
        let app = test_app();
        let tq = seed(&app).await;

        let (status, summary) = send(
            &app,
            "POST",
            &format!("/api/trackerqueries/{tq}/import"),
            Some(json!({
                "provider_type": "github",
                "records": [{"identifier": "broken", "payload": "{not json"}]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["failed"][0]["identifier"], "broken");

        let (status, body) = send(
            &app,
            "POST",
            "/api/trackerqueries/does-not-exist/import",
            Some(json!({"provider_type": "github", "records": []})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "not_found");
    }

    #[tokio::test]
    async fn trackers_with_queries_cannot_be_deleted() {
        let app = test_app();
        let tq = seed(&app).await;
        let (_, query) = send(&app, "GET", &format!("/api/trackerqueries/{tq}"), None).await;
        let tracker_id = query["tracker_id"].as_str().unwrap();

        let (status, _) = send(&app, "DELETE", &format!("/api/trackers/{tracker_id}"), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, "DELETE", &format!("/api/trackerqueries/{tq}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, "DELETE", &format!("/api/trackers/{tracker_id}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn tracker_query_writes_update_the_scheduler() {
        let importer = test_importer();
        let scheduler = Arc::new(
            QueryScheduler::new(
                importer.clone(),
                Arc::new(BundleDirectorySource::new("no-bundles")),
            )
            .await
            .unwrap(),
        );
        scheduler.start().await.unwrap();
        let app = app(AppState::new(importer).with_scheduler(Arc::clone(&scheduler)));

        let tq = seed(&app).await;
        assert_eq!(scheduler.scheduled_queries().await, vec![tq.clone()]);

        let (_, query) = send(&app, "GET", &format!("/api/trackerqueries/{tq}"), None).await;
        let (status, _) = send(
            &app,
            "PUT",
            &format!("/api/trackerqueries/{tq}"),
            Some(json!({"query": "is:open", "schedule": "not a schedule", "tracker_id": query["tracker_id"]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(scheduler.scheduled_queries().await.is_empty());

        send(
            &app,
            "PUT",
            &format!("/api/trackerqueries/{tq}"),
            Some(json!({"query": "is:open", "schedule": "* * * * * *", "tracker_id": query["tracker_id"]})),
        )
        .await;
        assert_eq!(scheduler.scheduled_queries().await, vec![tq.clone()]);

        let (status, _) = send(&app, "DELETE", &format!("/api/trackerqueries/{tq}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(scheduler.scheduled_queries().await.is_empty());
        scheduler.shutdown().await.unwrap();
    }
}
