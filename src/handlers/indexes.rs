use crate::{Result, types::IndexInfo};
use axum::{Json, extract::State};
use super::AppState;

pub async fn list_indexes(State(state): State<AppState>) -> Result<Json<Vec<IndexInfo>>> {
    Ok(Json(state.engine.indexes().await?))
}
