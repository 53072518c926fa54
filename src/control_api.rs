//! Control API (spec §6 "Control API routes").
//!
//! Grounded in `internal/api/handler/http/handler.go`'s four routes and
//! status-code choices, rebuilt as an `axum` router the way the pack's
//! `axum`-based services (e.g. the cache proxy controller) structure
//! `State`-carrying handlers.

use crate::error::StoreError;
use crate::replay::replay;
use crate::scan::scan;
use crate::store::Store;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use std::sync::Arc;

pub fn router<S: Store + 'static>(store: Arc<S>) -> Router {
    Router::new()
        .route("/api/requests", get(list_requests::<S>))
        .route("/api/requests/{id}", get(get_request::<S>))
        .route("/api/repeat/{id}", get(repeat::<S>))
        .route("/api/scan/{id}", get(scan_request::<S>))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(store)
}

/// `GET /api/requests` (spec §6): 200 with the full list, 204 when the
/// store is empty, 500 on backend failure.
async fn list_requests<S: Store>(State(store): State<Arc<S>>) -> Response {
    match store.list_requests().await {
        Ok(requests) => Json(requests).into_response(),
        Err(StoreError::NotFound) => StatusCode::NO_CONTENT.into_response(),
        Err(StoreError::Backend(e)) => {
            tracing::error!("list_requests backend error: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// `GET /api/requests/:id` (spec §6): 200, 400 (malformed id), 404, 500.
async fn get_request<S: Store>(State(store): State<Arc<S>>, Path(id): Path<String>) -> Response {
    let Ok(id) = id.parse::<i64>() else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    match store.get_request(id).await {
        Ok(request) => Json(request).into_response(),
        Err(StoreError::NotFound) => StatusCode::NOT_FOUND.into_response(),
        Err(StoreError::Backend(e)) => {
            tracing::error!("get_request backend error: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// `GET /api/repeat/:id` (spec §6): 200 text/plain with the raw wire dump,
/// 400 (malformed id only), 500 (unknown id, store error, or upstream
/// failure — matching `handler.go`'s `RepeatRequest`, which maps every
/// non-parse failure to `StatusInternalServerError`).
async fn repeat<S: Store>(State(store): State<Arc<S>>, Path(id): Path<String>) -> Response {
    let Ok(id) = id.parse::<i64>() else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    match replay(store.as_ref(), id).await {
        Ok(dump) => dump.into_response(),
        Err(e) => {
            tracing::error!("replay failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Deserialize)]
struct ScanQuery {
    param: Option<String>,
}

/// `GET /api/scan/:id?param=name` (spec §6, §12): 200 with
/// `{"request_scan": "<param or empty>"}`, 400 (malformed id only), 500
/// (unknown id, store error, or upstream failure — same mapping as
/// `repeat`, above).
async fn scan_request<S: Store>(
    State(store): State<Arc<S>>,
    Path(id): Path<String>,
    Query(query): Query<ScanQuery>,
) -> Response {
    let Ok(id) = id.parse::<i64>() else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    match scan(store.as_ref(), id, query.param.as_deref()).await {
        Ok(reflected) => Json(serde_json::json!({ "request_scan": reflected })).into_response(),
        Err(e) => {
            tracing::error!("scan failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
