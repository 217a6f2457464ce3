//! Search API endpoint.

use axum::{
    Json,
    extract::{Query, State},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{ServiceError, ServiceResult};
use crate::search::{MatchMode, SearchHit};

use super::AppState;

#[derive(Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub query: String,
}

#[derive(Serialize)]
pub struct SearchResponse {
    pub mode: MatchMode,
    pub results: Vec<SearchHit>,
    pub truncated: bool,
}

/// Exact-then-fuzzy search over name, author and OCR text
pub async fn search_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> ServiceResult<Json<SearchResponse>> {
    let query = params.query.trim();
    if query.is_empty() {
        return Err(ServiceError::InvalidRequest {
            message: "query must not be empty".to_string(),
        });
    }

    let outcome = state.search.search(query).await?;
    Ok(Json(SearchResponse {
        mode: outcome.mode,
        results: outcome.hits,
        truncated: outcome.truncated,
    }))
}
