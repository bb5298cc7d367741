use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::limit::RequestBodyLimitLayer;
use uuid::Uuid;

use nibble_core::calendar::WeekAnchor;
use nibble_core::models::{
    Entry, EntryFilter, InsertOutcome, LedgerStats, NewEntry, Origin, SortOrder, Target,
    WeeklyDigest,
};
use nibble_core::service::{Created, Ledger};
use nibble_core::sync::{ReceiveOutcome, SyncBridgeHandle};

const BODY_LIMIT: usize = 64 * 1024;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) ledger: Arc<Ledger>,
    pub(crate) bridge: SyncBridgeHandle,
    pub(crate) api_key: Option<String>,
}

// --- Request / Response types ---

#[derive(Deserialize)]
struct CreateEntryRequest {
    id: Option<Uuid>,
    name: String,
    timestamp: Option<DateTime<Utc>>,
    target: Option<Target>,
    origin: Option<Origin>,
}

#[derive(Deserialize)]
struct EntriesQuery {
    from: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    target: Option<Target>,
}

#[derive(Deserialize)]
struct DigestQuery {
    at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize)]
struct AnchorsBody {
    week_start: WeekAnchor,
    digest_unlock: WeekAnchor,
}

#[derive(Serialize)]
struct SyncAccepted {
    outcome: ReceiveOutcome,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// --- Error handling ---

enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Internal(err) => {
                tracing::error!("internal server error: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

// --- Middleware ---

async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(ref expected_key) = state.api_key {
        let authorized = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|token| token == expected_key);

        if !authorized {
            return (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: "Invalid or missing pairing key".to_string(),
                }),
            )
                .into_response();
        }
    }
    next.run(request).await
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}

// --- Handlers ---

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "device": state.bridge.device(),
    }))
}

async fn create_entry(
    State(state): State<AppState>,
    Json(req): Json<CreateEntryRequest>,
) -> Result<(StatusCode, Json<Created>), ApiError> {
    let device = state.bridge.device();
    let origin = req.origin.unwrap_or_else(|| device.app_origin());
    if origin.is_peer_received() {
        return Err(ApiError::BadRequest(format!(
            "Origin '{origin}' is reserved for entries received from the paired device"
        )));
    }
    if origin.device() != device {
        return Err(ApiError::BadRequest(format!(
            "Origin '{origin}' does not belong to this {device}"
        )));
    }

    let created = state
        .ledger
        .create(NewEntry {
            id: req.id,
            name: req.name,
            timestamp: req.timestamp.unwrap_or_else(Utc::now),
            target: req.target.unwrap_or(Target::User),
            origin,
        })
        .map_err(|e| {
            if e.downcast_ref::<nibble_core::error::StoreError>().is_some() {
                ApiError::Internal(e)
            } else {
                ApiError::BadRequest(format!("{e}"))
            }
        })?;

    let status = match created.outcome {
        InsertOutcome::Created => StatusCode::CREATED,
        InsertOutcome::AlreadyExisted => StatusCode::OK,
    };
    Ok((status, Json(created)))
}

async fn list_entries(
    State(state): State<AppState>,
    Query(query): Query<EntriesQuery>,
) -> Result<Json<Vec<Entry>>, ApiError> {
    let filter = EntryFilter {
        from: query.from,
        until: query.until,
        target: query.target,
    };
    Ok(Json(state.ledger.entries(&filter, SortOrder::NewestFirst)?))
}

async fn today_entries(State(state): State<AppState>) -> Result<Json<Vec<Entry>>, ApiError> {
    Ok(Json(state.ledger.today(Utc::now())?))
}

async fn delete_entry(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if state.ledger.delete(id)? {
        Ok(Json(serde_json::json!({ "deleted": id })))
    } else {
        Err(ApiError::NotFound(format!("Entry {id} not found")))
    }
}

async fn delete_all_entries(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let removed = state.ledger.delete_all()?;
    Ok(Json(serde_json::json!({ "deleted": removed })))
}

async fn get_stats(State(state): State<AppState>) -> Result<Json<LedgerStats>, ApiError> {
    Ok(Json(state.ledger.stats(Utc::now())?))
}

async fn get_digest(
    State(state): State<AppState>,
    Query(query): Query<DigestQuery>,
) -> Result<Json<WeeklyDigest>, ApiError> {
    let now = Utc::now();
    Ok(Json(
        state
            .ledger
            .weekly_digest(query.at.unwrap_or(now), now)?,
    ))
}

async fn get_anchors(State(state): State<AppState>) -> Json<AnchorsBody> {
    let calendar = state.ledger.calendar();
    Json(AnchorsBody {
        week_start: calendar.week_start_anchor(),
        digest_unlock: calendar.digest_unlock_anchor(),
    })
}

async fn set_anchors(
    State(state): State<AppState>,
    Json(req): Json<AnchorsBody>,
) -> Result<Json<AnchorsBody>, ApiError> {
    state.ledger.set_anchors(req.week_start, req.digest_unlock)?;
    Ok(Json(req))
}

/// Accepts anything. There is no acknowledgment protocol, so a malformed
/// message gets the same status as a stored one.
async fn receive_sync(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<SyncAccepted>), ApiError> {
    let outcome = match serde_json::from_slice::<serde_json::Value>(&body) {
        Ok(raw) => state.bridge.receive(raw).await?,
        Err(err) => {
            tracing::debug!("dropping sync message that is not JSON: {err}");
            ReceiveOutcome::Malformed
        }
    };
    Ok((StatusCode::ACCEPTED, Json(SyncAccepted { outcome })))
}

pub(crate) fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/entries",
            post(create_entry)
                .get(list_entries)
                .delete(delete_all_entries),
        )
        .route("/api/entries/today", get(today_entries))
        .route("/api/entries/{id}", delete(delete_entry))
        .route("/api/stats", get(get_stats))
        .route("/api/digest", get(get_digest))
        .route("/api/settings/anchors", get(get_anchors).put(set_anchors))
        .route("/api/sync", post(receive_sync))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth))
        // Reachability probe target, deliberately outside auth
        .route("/api/health", get(health))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

// --- Server startup ---

pub async fn start_server(
    ledger: Arc<Ledger>,
    bridge: SyncBridgeHandle,
    port: u16,
    bind: &str,
    api_key: Option<String>,
) -> anyhow::Result<()> {
    let device = bridge.device();
    let state = AppState {
        ledger,
        bridge,
        api_key: api_key.clone(),
    };

    let app = build_router(state);

    if let Some(ref key) = api_key {
        eprintln!(
            "Pairing key: {} (see pairing_key file in data directory)",
            mask_key(key)
        );
    } else {
        eprintln!("Warning: Authentication disabled (--no-auth). API is open to anyone.");
    }

    if bind != "127.0.0.1" && bind != "localhost" && api_key.is_none() {
        eprintln!(
            "Warning: Listening on {bind} with no authentication. Any device on your network can access this API."
        );
    }

    let listener = tokio::net::TcpListener::bind(format!("{bind}:{port}")).await?;
    tracing::info!(%device, "listening on http://{bind}:{port}");
    axum::serve(listener, app).await?;

    Ok(())
}

/// First and last four characters of a key, or `****` when it is too short
/// to show any of it.
fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() < 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}
