use axum::{
    Json,
    extract::{Path, Query, State},
};
use crate::{
    Error, Result,
    types::{ApiQuery, CountResult, KeysResult},
};
use super::AppState;

pub async fn get_count(
    State(state): State<AppState>,
    Path(index): Path<String>,
    Query(query): Query<ApiQuery>,
) -> Result<Json<CountResult>> {
    let result = state.engine.count(&index, query.q.as_deref()).await?;
    Ok(Json(result))
}

pub async fn get_keys(
    State(state): State<AppState>,
    Path(index): Path<String>,
    Query(query): Query<ApiQuery>,
) -> Result<Json<KeysResult>> {
    let result = state.engine.keys(&index, query.limit).await?;
    Ok(Json(result))
}

/// Keys starting with `q`.
pub async fn get_match(
    State(state): State<AppState>,
    Path(index): Path<String>,
    Query(query): Query<ApiQuery>,
) -> Result<Json<KeysResult>> {
    let prefix = query
        .q
        .ok_or_else(|| Error::InvalidInput("missing query parameter `q`".to_string()))?;

    let result = state.engine.match_keys(&index, &prefix, query.limit).await?;
    Ok(Json(result))
}
