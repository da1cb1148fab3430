//! HTTP admin API and upload relay.
//!
//! Exposes every list/detail/edit action of the CLI as JSON endpoints, plus
//! the `POST /api/upload` relay that forwards a file to cloud storage.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/api/tables` | Entity tables and whether they are reachable |
//! | `GET`  | `/api/{table}` | List (`search`, `sort`, repeatable `filter=field:value`) |
//! | `POST` | `/api/{table}` | Create |
//! | `GET`  | `/api/{table}/{id}` | Fetch one |
//! | `PATCH` | `/api/{table}/{id}` | Update |
//! | `DELETE` | `/api/{table}/{id}` | Delete (join rows first) |
//! | `POST` | `/api/{table}/{id}/copy` | Copy with links |
//! | `GET`  | `/api/{table}/{id}/detail` | Record with related rows |
//! | `POST` | `/api/{table}/reorder` | `{from, to, scope?}` |
//! | `GET`  | `/api/relations/{relation}/counts?side=` | Links per row |
//! | `PUT`  | `/api/relations/{relation}/{side}/{id}` | `{ids}` replaces the links |
//! | `POST` | `/api/upload` | multipart `file` + `id` → `{success, url}` |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "invalid table: 'bones'. ..." } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `backend_error` (502).
//! The upload relay keeps its own `{ "success": false, "error": "..." }` shape.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so a browser front end
//! can call the API directly.

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query as UrlQuery, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::backend::{self, Backend};
use crate::config::Config;
use crate::crud::CrudService;
use crate::joins;
use crate::listing::{parse_filter, ListOptions, SortKey};
use crate::models::{scalar_string, Entity, Record, Relation};
use crate::storage::StorageClient;
use crate::tables::{table_statuses, TableStatus};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    backend: Arc<dyn Backend>,
    /// `None` when `[storage]` is not configured; uploads then fail with 503.
    storage: Option<Arc<StorageClient>>,
}

/// Starts the admin API on `[server].bind` with the configured backend.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let backend = backend::connect(config)?;
    run_server_with_backend(config, backend).await
}

/// Like [`run_server`], but with a caller-supplied backend.
pub async fn run_server_with_backend(
    config: &Config,
    backend: Arc<dyn Backend>,
) -> anyhow::Result<()> {
    let storage = if config.storage.is_configured() {
        Some(Arc::new(StorageClient::from_config(&config.storage)?))
    } else {
        tracing::warn!("[storage] not configured; POST /api/upload will answer 503");
        None
    };

    let state = AppState { backend, storage };
    let app = router(state, config.server.max_upload_bytes);

    let bind_addr = &config.server.bind;
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    println!("kbadmin API listening on http://{}", bind_addr);
    tracing::info!(bind = %bind_addr, "server started");

    axum::serve(listener, app).await?;
    Ok(())
}

fn router(state: AppState, max_upload_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/tables", get(handle_tables))
        .route("/api/upload", post(handle_upload))
        .route(
            "/api/relations/{relation}/counts",
            get(handle_link_counts),
        )
        .route(
            "/api/relations/{relation}/{side}/{id}",
            put(handle_set_links),
        )
        .route("/api/{table}", get(handle_list).post(handle_create))
        .route("/api/{table}/reorder", post(handle_reorder))
        .route(
            "/api/{table}/{id}",
            get(handle_get).patch(handle_update).delete(handle_delete),
        )
        .route("/api/{table}/{id}/copy", post(handle_copy))
        .route("/api/{table}/{id}/detail", get(handle_detail))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

/// Map an operation error to a status. Validation messages start with
/// `invalid`/`nothing to`, lookups report `not found`; anything else came
/// from the remote side.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        let message = format!("{:#}", err);
        if message.contains("not found") {
            AppError {
                status: StatusCode::NOT_FOUND,
                code: "not_found",
                message,
            }
        } else if message.starts_with("invalid") || message.starts_with("nothing to") {
            bad_request(message)
        } else {
            tracing::warn!(error = %message, "request failed");
            AppError {
                status: StatusCode::BAD_GATEWAY,
                code: "backend_error",
                message,
            }
        }
    }
}

fn service(state: &AppState, table: &str) -> Result<CrudService, AppError> {
    let entity = Entity::from_table(table).map_err(|e| bad_request(e.to_string()))?;
    Ok(CrudService::new(state.backend.clone(), entity))
}

fn record_from(body: Value) -> Result<Record, AppError> {
    Record::from_value(body).map_err(|e| bad_request(e.to_string()))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn handle_tables(State(state): State<AppState>) -> Json<Vec<TableStatus>> {
    Json(table_statuses(state.backend.as_ref()).await)
}

// ============ Records ============

/// `search`, `sort` and repeatable `filter` query parameters.
fn list_options(params: &[(String, String)]) -> Result<ListOptions, AppError> {
    let mut opts = ListOptions::default();
    for (key, value) in params {
        match key.as_str() {
            "search" => opts.search = Some(value.clone()),
            "sort" => opts.sort = Some(SortKey::parse(value).map_err(|e| bad_request(e.to_string()))?),
            "filter" => opts
                .filters
                .push(parse_filter(value).map_err(|e| bad_request(e.to_string()))?),
            _ => {}
        }
    }
    Ok(opts)
}

async fn handle_list(
    State(state): State<AppState>,
    Path(table): Path<String>,
    UrlQuery(params): UrlQuery<Vec<(String, String)>>,
) -> Result<Json<Vec<Record>>, AppError> {
    let svc = service(&state, &table)?;
    let opts = list_options(&params)?;
    let mut rows = svc.list(&opts).await?;
    joins::attach_parent(state.backend.as_ref(), svc.entity(), &mut rows).await?;
    Ok(Json(rows))
}

async fn handle_create(
    State(state): State<AppState>,
    Path(table): Path<String>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Record>), AppError> {
    let created = service(&state, &table)?.create(record_from(body)?).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn handle_get(
    State(state): State<AppState>,
    Path((table, id)): Path<(String, String)>,
) -> Result<Json<Record>, AppError> {
    Ok(Json(service(&state, &table)?.fetch_one(&id).await?))
}

async fn handle_update(
    State(state): State<AppState>,
    Path((table, id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Result<Json<Record>, AppError> {
    let updated = service(&state, &table)?
        .update(&id, record_from(body)?)
        .await?;
    Ok(Json(updated))
}

async fn handle_delete(
    State(state): State<AppState>,
    Path((table, id)): Path<(String, String)>,
) -> Result<Json<Value>, AppError> {
    service(&state, &table)?.delete(&id).await?;
    Ok(Json(json!({ "deleted": id })))
}

async fn handle_copy(
    State(state): State<AppState>,
    Path((table, id)): Path<(String, String)>,
) -> Result<(StatusCode, Json<Record>), AppError> {
    let copy = service(&state, &table)?.copy(&id).await?;
    Ok((StatusCode::CREATED, Json(copy)))
}

async fn handle_detail(
    State(state): State<AppState>,
    Path((table, id)): Path<(String, String)>,
) -> Result<Json<joins::Detail>, AppError> {
    let svc = service(&state, &table)?;
    let detail = joins::detail(state.backend.as_ref(), svc.entity(), &id).await?;
    Ok(Json(detail))
}

#[derive(Deserialize)]
struct ReorderRequest {
    from: usize,
    to: usize,
    #[serde(default)]
    scope: Option<String>,
}

async fn handle_reorder(
    State(state): State<AppState>,
    Path(table): Path<String>,
    Json(req): Json<ReorderRequest>,
) -> Result<Json<Value>, AppError> {
    let (rows, changes) = service(&state, &table)?
        .reorder(req.from, req.to, req.scope.as_deref())
        .await?;
    Ok(Json(json!({ "rows": rows, "changes": changes })))
}

// ============ Relations ============

#[derive(Deserialize)]
struct CountsQuery {
    side: String,
}

async fn handle_link_counts(
    State(state): State<AppState>,
    Path(relation): Path<String>,
    UrlQuery(q): UrlQuery<CountsQuery>,
) -> Result<Json<Value>, AppError> {
    let relation = Relation::find(&relation)?;
    let side = relation
        .side_of(&q.side)
        .map_err(|e| bad_request(e.to_string()))?;
    let counts = joins::link_counts(state.backend.as_ref(), relation, side).await?;
    Ok(Json(json!(counts)))
}

#[derive(Deserialize)]
struct LinksRequest {
    ids: Vec<Value>,
}

/// Only strings and numbers are ids; anything else rejects the whole body.
fn link_ids(values: &[Value]) -> Result<Vec<String>, AppError> {
    values
        .iter()
        .map(|v| match v {
            Value::String(_) | Value::Number(_) => scalar_string(v)
                .ok_or_else(|| bad_request(format!("invalid id: {}", v))),
            other => Err(bad_request(format!(
                "invalid id: {} (expected a string or number)",
                other
            ))),
        })
        .collect()
}

async fn handle_set_links(
    State(state): State<AppState>,
    Path((relation, side, id)): Path<(String, String, String)>,
    Json(req): Json<LinksRequest>,
) -> Result<Json<joins::LinkDiff>, AppError> {
    let relation = Relation::find(&relation)?;
    let side = relation
        .side_of(&side)
        .map_err(|e| bad_request(e.to_string()))?;
    let ids = link_ids(&req.ids)?;
    let diff = joins::set_links(state.backend.as_ref(), relation, side, &id, &ids).await?;
    Ok(Json(diff))
}

// ============ POST /api/upload ============

fn upload_failure(status: StatusCode, message: impl Into<String>) -> Response {
    let message = message.into();
    tracing::warn!(%status, error = %message, "upload rejected");
    (
        status,
        Json(json!({ "success": false, "error": message })),
    )
        .into_response()
}

/// Handler for `POST /api/upload`.
///
/// Expects a multipart body with a `file` part and an `id` text part, and
/// answers `{ "success": true, "url": "..." }` once the storage API has
/// the bytes.
async fn handle_upload(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    let mut id: Option<String> = None;
    let mut file: Option<(String, Vec<u8>)> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return upload_failure(StatusCode::BAD_REQUEST, e.to_string()),
        };
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("id") => match field.text().await {
                Ok(text) => id = Some(text),
                Err(e) => return upload_failure(StatusCode::BAD_REQUEST, e.to_string()),
            },
            Some("file") => {
                let filename = field.file_name().unwrap_or("upload.bin").to_string();
                match field.bytes().await {
                    Ok(bytes) => file = Some((filename, bytes.to_vec())),
                    Err(e) => return upload_failure(StatusCode::BAD_REQUEST, e.to_string()),
                }
            }
            _ => {}
        }
    }

    let Some(id) = id.filter(|s| !s.trim().is_empty()) else {
        return upload_failure(StatusCode::BAD_REQUEST, "missing id");
    };
    let Some((filename, bytes)) = file else {
        return upload_failure(StatusCode::BAD_REQUEST, "missing file");
    };
    let Some(storage) = state.storage.clone() else {
        return upload_failure(StatusCode::SERVICE_UNAVAILABLE, "storage is disabled");
    };

    match storage.relay_upload(&id, &filename, bytes).await {
        Ok(url) => Json(json!({ "success": true, "url": url })).into_response(),
        Err(e) => upload_failure(StatusCode::BAD_GATEWAY, format!("{:#}", e)),
    }
}
