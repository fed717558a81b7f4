use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use scanstate_api::{EntityKey, Page, StateStore, StoreError};

#[derive(Clone)]
struct AppState {
    store: Arc<dyn StateStore>,
}

/// Read-only inspection API over the state store.
pub fn router(store: Arc<dyn StateStore>) -> Router {
    Router::new()
        .route("/api/health", get(handle_health))
        .route("/api/records", get(handle_list))
        .route("/api/records/{ip}/{port}/{service}", get(handle_get))
        .with_state(AppState { store })
}

/// Serve on `listener` until `shutdown` is cancelled.
pub async fn serve(listener: TcpListener, store: Arc<dyn StateStore>, shutdown: CancellationToken) -> Result<(), String> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "inspection api listening");
    }
    axum::serve(listener, router(store))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| format!("axum serve: {e}"))
}

// --- GET /api/health ---

/// Reads one row from the store so a closed or disconnected store
/// reports unavailable.
async fn handle_health(State(state): State<AppState>) -> Response {
    let kind = state.store.kind();
    match state.store.list(Page::new(1, 0)).await {
        Ok(_) => Json(json!({"status": "ok", "store": kind})).into_response(),
        Err(e) => {
            tracing::warn!(store = %kind, error = %e, "health check failed");
            let body = json!({"status": "unavailable", "store": kind, "error": e.to_string()});
            (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
        }
    }
}

// --- GET /api/records?limit=&offset= ---

#[derive(Deserialize)]
struct ListParams {
    #[serde(default)]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

async fn handle_list(State(state): State<AppState>, Query(params): Query<ListParams>) -> Response {
    match state.store.list(Page::new(params.limit, params.offset)).await {
        Ok(records) => Json(records).into_response(),
        Err(e) => store_error(e),
    }
}

// --- GET /api/records/{ip}/{port}/{service} ---

async fn handle_get(
    State(state): State<AppState>,
    Path((ip, port, service)): Path<(String, u32, String)>,
) -> Response {
    let key = EntityKey::new(ip, port, service);
    match state.store.get(&key).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, Json(json!({"error": format!("no record for {key}")}))).into_response(),
        Err(e) => store_error(e),
    }
}

fn store_error(e: StoreError) -> Response {
    let status = match e {
        StoreError::Closed | StoreError::Connection(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    tracing::warn!(error = %e, "inspection query failed");
    (status, Json(json!({"error": e.to_string()}))).into_response()
}
