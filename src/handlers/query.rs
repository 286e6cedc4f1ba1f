use axum::{
    Json,
    extract::{Path, Query, State},
    http::header,
    response::{IntoResponse, Response},
};
use crate::{
    Error, Result,
    types::{ApiQuery, ContQuery, QueryResult, parse_format},
};
use super::AppState;

pub async fn get_query(
    State(state): State<AppState>,
    Path(index): Path<String>,
    Query(query): Query<ApiQuery>,
) -> Result<Json<QueryResult>> {
    let q = query
        .q
        .ok_or_else(|| Error::InvalidInput("missing query parameter `q`".to_string()))?;
    let format = parse_format(query.format.as_deref())?.unwrap_or_default();

    let result = state.engine.query(&index, &q, query.limit, format).await?;
    Ok(Json(result))
}

pub async fn get_all(
    State(state): State<AppState>,
    Path(index): Path<String>,
    Query(query): Query<ApiQuery>,
) -> Result<Json<QueryResult>> {
    let format = parse_format(query.format.as_deref())?.unwrap_or_default();

    let result = state.engine.all(&index, query.limit, format).await?;
    Ok(Json(result))
}

/// `HEAD /api/query/:index`: the bytes a query would read, as `Content-Length`.
pub async fn head_query(
    State(state): State<AppState>,
    Path(index): Path<String>,
    Query(query): Query<ApiQuery>,
) -> Result<Response> {
    let q = query
        .q
        .ok_or_else(|| Error::InvalidInput("missing query parameter `q`".to_string()))?;

    let total = state.engine.byte_total(&index, Some(&q)).await?;
    Ok([(header::CONTENT_LENGTH, total.to_string())].into_response())
}

/// `HEAD /api/all/:index`: the bytes of every record, as `Content-Length`.
pub async fn head_all(
    State(state): State<AppState>,
    Path(index): Path<String>,
) -> Result<Response> {
    let total = state.engine.byte_total(&index, None).await?;
    Ok([(header::CONTENT_LENGTH, total.to_string())].into_response())
}

pub async fn get_cont(
    State(state): State<AppState>,
    Query(query): Query<ContQuery>,
) -> Result<Json<QueryResult>> {
    let token = query
        .token
        .ok_or_else(|| Error::InvalidInput("missing query parameter `token`".to_string()))?;
    let format = parse_format(query.format.as_deref())?;

    let result = state.engine.resume(&token, format).await?;
    Ok(Json(result))
}
