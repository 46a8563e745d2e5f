use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::catalog::{SubtitleTrackRecord, VideoRecord, VideoStatus};

use super::error::{ApiError, ApiResult};
use super::AppState;

const DEFAULT_PER_PAGE: usize = 20;
const MAX_PER_PAGE: usize = 100;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    page: Option<usize>,
    per_page: Option<usize>,
    status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct VideoList {
    videos: Vec<VideoRecord>,
    page: usize,
    per_page: usize,
    total: usize,
}

pub async fn list_videos(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<VideoList>> {
    let page = query.page.unwrap_or(1).max(1);
    let per_page = query
        .per_page
        .unwrap_or(DEFAULT_PER_PAGE)
        .clamp(1, MAX_PER_PAGE);
    let status = match &query.status {
        Some(raw) => Some(
            raw.parse::<VideoStatus>()
                .map_err(|err| ApiError::bad_request(err))?,
        ),
        None => None,
    };

    let counts = state.catalog.count_by_status()?;
    let total = match status {
        Some(status) => counts.get(status.as_str()).copied().unwrap_or(0),
        None => counts.values().copied().sum(),
    };
    let videos = state
        .catalog
        .list_videos(status, per_page, (page - 1) * per_page)?;
    Ok(Json(VideoList {
        videos,
        page,
        per_page,
        total,
    }))
}

#[derive(Debug, Serialize)]
pub struct VideoDetail {
    #[serde(flatten)]
    video: VideoRecord,
    segments: usize,
    subtitles: Vec<SubtitleTrackRecord>,
}

pub async fn get_video(
    State(state): State<AppState>,
    Path(video_id): Path<String>,
) -> ApiResult<Json<VideoDetail>> {
    let video = state
        .catalog
        .video_by_id(&video_id)?
        .ok_or_else(|| ApiError::not_found(format!("video {video_id} not found")))?;
    let segments = state.catalog.segments_for_video(&video_id)?.len();
    let subtitles = state.catalog.subtitles_for_video(&video_id)?;
    Ok(Json(VideoDetail {
        video,
        segments,
        subtitles,
    }))
}

#[derive(Debug, Serialize)]
pub struct DeleteResult {
    deleted: String,
}

pub async fn delete_video(
    State(state): State<AppState>,
    Path(video_id): Path<String>,
) -> ApiResult<Json<DeleteResult>> {
    if state.ingest.delete_video(&video_id).await? {
        Ok(Json(DeleteResult { deleted: video_id }))
    } else {
        Err(ApiError::not_found(format!("video {video_id} not found")))
    }
}
