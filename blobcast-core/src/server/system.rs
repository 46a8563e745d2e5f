use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::cache::CacheStatsSnapshot;

use super::error::ApiResult;
use super::AppState;

pub async fn cache_stats(State(state): State<AppState>) -> ApiResult<Json<CacheStatsSnapshot>> {
    Ok(Json(state.cache.stats().await))
}

#[derive(Debug, Serialize)]
pub struct ClearResult {
    cleared: bool,
}

pub async fn cache_clear(State(state): State<AppState>) -> ApiResult<Json<ClearResult>> {
    state.cache.clear().await;
    Ok(Json(ClearResult { cleared: true }))
}
