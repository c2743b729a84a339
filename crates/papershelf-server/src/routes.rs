//! HTTP surface over [`FileStore`].

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use once_cell::sync::Lazy;
use papershelf_core::bridge::StoredPaper;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::store::{FileStore, StoreError};

/// Only names the server itself generates: `<uuid-v4>.pdf`. Anything
/// else (dotfiles, traversal, other extensions) is rejected outright.
static SERVED_FILE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\.pdf$")
        .expect("literal pattern")
});

pub struct AppState {
    pub store: FileStore,
}

pub enum ApiError {
    Store(StoreError),
    NotFound,
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Store(StoreError::Decode(e)) => {
                (StatusCode::BAD_REQUEST, format!("invalid payload: {e}"))
            }
            Self::Store(e) => {
                tracing::error!(error = %e, "storage operation failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "storage failure".into())
            }
            Self::NotFound => (StatusCode::NOT_FOUND, "not found".into()),
        };
        (
            status,
            Json(serde_json::json!({ "success": false, "error": message })),
        )
            .into_response()
    }
}

#[derive(Serialize)]
struct SaveResponse {
    success: bool,
    file: String,
}

#[derive(Serialize, Deserialize)]
struct BannerBody {
    banner: Option<String>,
}

pub fn router(state: Arc<AppState>) -> axum::Router {
    axum::Router::new()
        .route(
            "/papers",
            axum::routing::get(list_papers).post(save_paper),
        )
        .route("/papers/{id}", axum::routing::delete(delete_paper))
        .route(
            "/config/banner",
            axum::routing::get(get_banner).post(set_banner),
        )
        .route("/health", axum::routing::get(health))
        .route("/files/{file}", axum::routing::get(get_file))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn list_papers(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<StoredPaper>>, ApiError> {
    Ok(Json(state.store.list().await?))
}

async fn save_paper(
    State(state): State<Arc<AppState>>,
    Json(paper): Json<StoredPaper>,
) -> Result<Json<SaveResponse>, ApiError> {
    let id = paper.id.clone();
    let file = state.store.upsert(paper).await?;
    tracing::debug!(id, file, "paper saved");
    Ok(Json(SaveResponse {
        success: true,
        file,
    }))
}

async fn delete_paper(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let removed = state.store.delete(&id).await?;
    tracing::debug!(id, removed, "paper deleted");
    Ok(Json(serde_json::json!({ "success": true })))
}

async fn get_banner(
    State(state): State<Arc<AppState>>,
) -> Result<Json<BannerBody>, ApiError> {
    Ok(Json(BannerBody {
        banner: state.store.banner().await?,
    }))
}

async fn set_banner(
    State(state): State<Arc<AppState>>,
    Json(body): Json<BannerBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.store.set_banner(body.banner).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

async fn health(State(state): State<Arc<AppState>>) -> Response {
    if state.store.probe_writable().await {
        (StatusCode::OK, "ok").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "storage not writable").into_response()
    }
}

async fn get_file(
    State(state): State<Arc<AppState>>,
    Path(file): Path<String>,
) -> Result<Response, ApiError> {
    // Traversal attempts and foreign extensions get the same answer as
    // a missing file.
    if !SERVED_FILE.is_match(&file) {
        return Err(ApiError::NotFound);
    }
    let id = file.trim_end_matches(".pdf");
    let bytes = tokio::fs::read(state.store.file_path(id))
        .await
        .map_err(|_| ApiError::NotFound)?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/pdf")],
        bytes,
    )
        .into_response())
}
