//! REST API Handlers
//!
//! Resources for feed sources, allowlists and the aggregated node registry.
//! Every list route answers with the `{cursor, total, has_more, data}`
//! envelope and takes `after` / `limit` query parameters.

use crate::domain::ports::{AllowlistEntry, AllowlistId, EntryId, NodeFilter, Period, Source, SourceId, StorageRef};
use crate::error::Error;
use crate::ledger::SourceLedger;
use crate::registry::{clamp_limit, parse_cursor, AggregatedNode, AllowlistService, NodeAggregator, Paginated};
use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error};

// =============================================================================
// Request/Response Types
// =============================================================================

/// Keyset page parameters
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageParams {
    #[serde(default)]
    pub after: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Parameters of the `/nodes` route
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeParams {
    #[serde(default)]
    pub after: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    /// Restrict to (or with `invert`, exclude) this allowlist
    #[serde(default)]
    pub allowlist_id: Option<i64>,
    #[serde(default)]
    pub invert: bool,
}

/// Source registration request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSourceRequest {
    pub name: String,
    pub url: String,
    /// Refresh period, e.g. `1h` or `15m`
    pub period: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAllowlistRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateEntryRequest {
    pub cidr_block: String,
}

/// Allowlist entry as exposed over the API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowlistEntryItem {
    pub id: EntryId,
    pub cidr_block: String,
    pub allowlist_id: AllowlistId,
}

impl From<AllowlistEntry> for AllowlistEntryItem {
    fn from(entry: AllowlistEntry) -> Self {
        Self {
            id: entry.id,
            cidr_block: entry.cidr.to_string(),
            allowlist_id: entry.allowlist_id,
        }
    }
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Handler error carrying a crate error to the client
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        } else {
            debug!(error = %self.0, status = status.as_u16(), "Request rejected");
        }

        (
            status,
            Json(ApiErrorResponse {
                error: self.0.code().into(),
                message: self.0.to_string(),
                details: None,
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// =============================================================================
// REST Router
// =============================================================================

/// Page size bounds for list routes
#[derive(Debug, Clone, Copy)]
pub struct PageLimits {
    pub default: usize,
    pub max: usize,
}

impl Default for PageLimits {
    fn default() -> Self {
        Self {
            default: 10,
            max: 1000,
        }
    }
}

/// REST API router builder
pub struct RestRouter {
    ledger: Arc<SourceLedger>,
    limits: PageLimits,
}

impl RestRouter {
    pub fn new(ledger: Arc<SourceLedger>, limits: PageLimits) -> Self {
        Self { ledger, limits }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let storage = self.ledger.storage().clone();
        let state = AppState {
            aggregator: NodeAggregator::new(storage.clone()),
            allowlists: AllowlistService::new(storage.clone()),
            ledger: self.ledger,
            storage,
            limits: self.limits,
        };

        Router::new()
            // Source endpoints
            .route("/sources", get(list_sources).post(create_source))
            .route("/sources/:id", get(get_source))
            .route("/sources/:id/nodes", get(list_source_nodes))
            .route("/sources/:id/start", post(start_source))
            .route("/sources/:id/stop", post(stop_source))
            // Allowlist endpoints
            .route("/allowlist", get(list_allowlists).post(create_allowlist))
            .route("/allowlist/:id", get(get_allowlist).delete(delete_allowlist))
            .route("/allowlist/:id/entry", get(list_entries).post(create_entry))
            .route("/allowlist/:id/entry/:entry_id", delete(delete_entry))
            // Node registry
            .route("/nodes", get(list_nodes))
            // Health endpoints
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    ledger: Arc<SourceLedger>,
    aggregator: Arc<NodeAggregator>,
    allowlists: Arc<AllowlistService>,
    storage: StorageRef,
    limits: PageLimits,
}

impl AppState {
    fn limit(&self, requested: Option<usize>) -> usize {
        clamp_limit(requested, self.limits.default, self.limits.max)
    }
}

/// Parse a numeric `after` cursor; empty means from the start
fn id_cursor(raw: Option<&str>) -> std::result::Result<Option<i64>, Error> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(raw) => raw.parse().map(Some).map_err(|_| Error::InvalidCursor {
            value: raw.to_string(),
        }),
    }
}

// =============================================================================
// Source Handlers
// =============================================================================

async fn list_sources(
    State(state): State<AppState>,
    Query(params): Query<PageParams>,
) -> ApiResult<Json<Paginated<Source>>> {
    let limit = state.limit(params.limit);
    let after = id_cursor(params.after.as_deref())?.map(SourceId);
    let sources = state.ledger.list(after, limit).await?;
    Ok(Json(Paginated::from_page(sources, limit, |s| s.id.to_string())))
}

async fn create_source(
    State(state): State<AppState>,
    Json(request): Json<CreateSourceRequest>,
) -> ApiResult<(StatusCode, Json<Source>)> {
    let period = Period::parse(&request.period)?;
    let source = state.ledger.create(&request.name, &request.url, period).await?;
    Ok((StatusCode::CREATED, Json(source)))
}

async fn get_source(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<Source>> {
    Ok(Json(state.ledger.get(SourceId(id)).await?))
}

async fn list_source_nodes(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<PageParams>,
) -> ApiResult<Json<Paginated<AggregatedNode>>> {
    let limit = state.limit(params.limit);
    let cursor = parse_cursor(params.after.as_deref().unwrap_or(""))?;
    let page = state
        .aggregator
        .query(NodeFilter::Source(SourceId(id)), cursor, limit)
        .await?;
    Ok(Json(page))
}

async fn start_source(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<Source>> {
    Ok(Json(state.ledger.start(SourceId(id)).await?))
}

async fn stop_source(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<Source>> {
    Ok(Json(state.ledger.stop(SourceId(id)).await?))
}

// =============================================================================
// Allowlist Handlers
// =============================================================================

async fn list_allowlists(
    State(state): State<AppState>,
    Query(params): Query<PageParams>,
) -> ApiResult<impl IntoResponse> {
    let limit = state.limit(params.limit);
    let after = id_cursor(params.after.as_deref())?.map(AllowlistId);
    let lists = state.allowlists.list(after, limit).await?;
    Ok(Json(Paginated::from_page(lists, limit, |l| l.id.to_string())))
}

async fn create_allowlist(
    State(state): State<AppState>,
    Json(request): Json<CreateAllowlistRequest>,
) -> ApiResult<impl IntoResponse> {
    let list = state.allowlists.create(&request.name).await?;
    Ok((StatusCode::CREATED, Json(list)))
}

async fn get_allowlist(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.allowlists.get(AllowlistId(id)).await?))
}

async fn delete_allowlist(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<StatusCode> {
    state.allowlists.delete(AllowlistId(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_entries(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Paginated<AllowlistEntryItem>>> {
    let entries: Vec<AllowlistEntryItem> = state
        .allowlists
        .entries(AllowlistId(id))
        .await?
        .into_iter()
        .map(AllowlistEntryItem::from)
        .collect();
    // Entries come back whole, so there is never a next page
    let limit = entries.len() + 1;
    Ok(Json(Paginated::from_page(entries, limit, |e| e.id.to_string())))
}

async fn create_entry(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<CreateEntryRequest>,
) -> ApiResult<(StatusCode, Json<AllowlistEntryItem>)> {
    let entry = state.allowlists.add_entry(AllowlistId(id), &request.cidr_block).await?;
    Ok((StatusCode::CREATED, Json(entry.into())))
}

async fn delete_entry(
    State(state): State<AppState>,
    Path((id, entry_id)): Path<(i64, i64)>,
) -> ApiResult<StatusCode> {
    state
        .allowlists
        .remove_entry(AllowlistId(id), EntryId(entry_id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Node Handlers
// =============================================================================

async fn list_nodes(
    State(state): State<AppState>,
    Query(params): Query<NodeParams>,
) -> ApiResult<Json<Paginated<AggregatedNode>>> {
    let limit = state.limit(params.limit);
    let cursor = parse_cursor(params.after.as_deref().unwrap_or(""))?;
    let filter = match (params.allowlist_id, params.invert) {
        (None, false) => NodeFilter::All,
        (None, true) => {
            return Err(Error::Validation("invert requires allowlist_id".into()).into());
        }
        (Some(id), false) => NodeFilter::InsideAllowlist(AllowlistId(id)),
        (Some(id), true) => NodeFilter::OutsideAllowlist(AllowlistId(id)),
    };

    Ok(Json(state.aggregator.query(filter, cursor, limit).await?))
}

/// Health check
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness check
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.storage.health_check().await {
        Ok(true) => (StatusCode::OK, "ready"),
        Ok(false) | Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "storage unavailable"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{NodeObservation, Storage};
    use crate::ledger::ManualClock;
    use crate::net::NodeAddress;
    use crate::storage::MemoryStore;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn router() -> (Router, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()));
        let ledger = SourceLedger::new(store.clone(), clock);
        (RestRouter::new(ledger, PageLimits::default()).build(), store)
    }

    async fn call(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(body) => Body::from(body.to_string()),
                None => Body::empty(),
            })
            .unwrap();

        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into()))
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_source_lifecycle() {
        let (router, _store) = router();

        let (status, body) = call(
            &router,
            Method::POST,
            "/sources",
            Some(json!({"name": "spamhaus", "url": "https://feeds.local/drop.csv", "period": "1h"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["version"], 0);
        assert_eq!(body["period"], "1h");
        assert_eq!(body["enabled"], true);
        let id = body["id"].as_i64().unwrap();

        let (status, body) = call(
            &router,
            Method::POST,
            "/sources",
            Some(json!({"name": "spamhaus", "url": "https://feeds.local/other.csv", "period": "1h"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "already_exists");

        let (status, body) = call(&router, Method::POST, &format!("/sources/{}/stop", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["enabled"], false);
        assert_eq!(body["version"], 1);

        let (status, body) = call(&router, Method::POST, &format!("/sources/{}/start", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["enabled"], true);

        let (status, body) = call(&router, Method::GET, "/sources?limit=1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 1);
        assert_eq!(body["has_more"], true);
        assert_eq!(body["cursor"], id.to_string());

        let (status, body) = call(&router, Method::GET, &format!("/sources?after={}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], json!([]));
        assert_eq!(body["cursor"], "");

        let (status, _) = call(&router, Method::GET, "/sources/999", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_source_validation() {
        let (router, _store) = router();
        for body in [
            json!({"name": "a", "url": "https://feeds.local/a.csv", "period": "soon"}),
            json!({"name": "a", "url": "ftp://feeds.local/a.csv", "period": "1h"}),
            json!({"name": "", "url": "https://feeds.local/a.csv", "period": "1h"}),
        ] {
            let (status, body) = call(&router, Method::POST, "/sources", Some(body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body["error"], "validation_error");
        }

        let (status, _) = call(&router, Method::GET, "/sources?after=abc", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_allowlist_and_nodes() {
        let (router, store) = router();
        let (_, source) = call(
            &router,
            Method::POST,
            "/sources",
            Some(json!({"name": "feed", "url": "http://feeds.local/feed.csv", "period": "15m"})),
        )
        .await;
        let source_id = SourceId(source["id"].as_i64().unwrap());
        let observed_at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        store
            .batch_insert_nodes(
                ["10.0.0.5", "10.0.1.5"]
                    .iter()
                    .map(|a| NodeObservation {
                        address: NodeAddress::parse(a).unwrap(),
                        source_id,
                        version: 1,
                        observed_at,
                    })
                    .collect(),
            )
            .await
            .unwrap();

        let (status, list) = call(&router, Method::POST, "/allowlist", Some(json!({"name": "office"}))).await;
        assert_eq!(status, StatusCode::CREATED);
        let list_id = list["id"].as_i64().unwrap();

        let (status, entry) = call(
            &router,
            Method::POST,
            &format!("/allowlist/{}/entry", list_id),
            Some(json!({"cidr_block": "10.0.0.0/24"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(entry["cidr_block"], "10.0.0.0/24");
        assert_eq!(entry["allowlist_id"], list_id);

        let (status, _) = call(
            &router,
            Method::POST,
            &format!("/allowlist/{}/entry", list_id),
            Some(json!({"cidr_block": "10.0.0.0"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, entries) = call(&router, Method::GET, &format!("/allowlist/{}/entry", list_id), None).await;
        assert_eq!(entries["total"], 1);
        assert_eq!(entries["has_more"], false);

        let (status, inside) =
            call(&router, Method::GET, &format!("/nodes?allowlist_id={}", list_id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(inside["total"], 1);
        assert_eq!(inside["data"][0]["ip_addr"], "10.0.0.5");
        assert_eq!(inside["data"][0]["sources"][0]["source_id"], source_id.0);
        assert_eq!(inside["data"][0]["sources"][0]["version"], 1);

        let (_, outside) = call(
            &router,
            Method::GET,
            &format!("/nodes?allowlist_id={}&invert=true", list_id),
            None,
        )
        .await;
        assert_eq!(outside["data"][0]["ip_addr"], "10.0.1.5");

        let (_, page) = call(&router, Method::GET, "/nodes?limit=1", None).await;
        assert_eq!(page["cursor"], "10.0.0.5");
        assert_eq!(page["has_more"], true);
        let (_, page) = call(&router, Method::GET, "/nodes?limit=1&after=10.0.0.5", None).await;
        assert_eq!(page["data"][0]["ip_addr"], "10.0.1.5");

        let (_, by_source) =
            call(&router, Method::GET, &format!("/sources/{}/nodes", source_id), None).await;
        assert_eq!(by_source["total"], 2);

        let (status, _) = call(&router, Method::GET, "/nodes?invert=true", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = call(&router, Method::GET, "/nodes?after=not-an-ip", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let entry_id = entry["id"].as_i64().unwrap();
        let (status, _) = call(
            &router,
            Method::DELETE,
            &format!("/allowlist/{}/entry/{}", list_id, entry_id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = call(&router, Method::DELETE, &format!("/allowlist/{}", list_id), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) =
            call(&router, Method::GET, &format!("/nodes?allowlist_id={}", list_id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_endpoints() {
        let (router, _store) = router();
        let (status, body) = call(&router, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Value::String("ok".into()));

        let (status, _) = call(&router, Method::GET, "/ready", None).await;
        assert_eq!(status, StatusCode::OK);
    }
}
