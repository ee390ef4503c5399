use crate::{
    api::{error::ApiError, response::ApiResponse, state::AppState},
    cache::schema::CONTENT_TYPE,
    db::documents,
    indexing::UpdateRequest,
    models::{ethereum::ADDRESS_TYPE, Document},
    validation::normalize_address,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

// POST /update query parameters
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateQuery {
    #[serde(default)]
    real_time: Option<bool>,
}

pub fn create_router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/update", post(run_update))
        .route("/{doc_type}/{id}", get(get_document))
        .with_state(app_state)
}

// GET /{type}/{id}: a document that is not (or no longer) indexed is a 404
async fn get_document(
    State(state): State<Arc<AppState>>,
    Path((doc_type, id)): Path<(String, String)>,
) -> Result<ApiResponse<Document>, ApiError> {
    let id = if doc_type == ADDRESS_TYPE {
        normalize_address(&id)?
    } else {
        id
    };

    let doc = if doc_type == CONTENT_TYPE {
        state
            .schema_cache
            .content_type(&state.db_pool, &id)
            .await?
            .map(|doc| (*doc).clone())
    } else {
        documents::get_document(&state.db_pool, &doc_type, &id).await?
    };

    doc.map(ApiResponse::new)
        .ok_or(ApiError::NotFound { doc_type, id })
}

// POST /update: run a pass and answer once it completed
async fn run_update(
    State(state): State<Arc<AppState>>,
    Query(params): Query<UpdateQuery>,
) -> Result<StatusCode, ApiError> {
    let real_time = params.real_time.unwrap_or(true);
    info!("Update requested (real time: {})", real_time);

    let request = UpdateRequest {
        real_time,
        hints: Vec::new(),
    };
    state
        .coordinator
        .update(request)
        .await
        .map_err(|e| ApiError::Indexing(e.to_string()))?;

    Ok(StatusCode::NO_CONTENT)
}
