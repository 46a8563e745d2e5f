use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use futures::stream::{self, StreamExt};
use tracing::warn;

use crate::cache::{CachedSegment, FetchError, SegmentKey, SegmentPayload, SEGMENT_CONTENT_TYPE};
use crate::catalog::{SubtitleTrackRecord, VideoRecord, VideoStatus};
use crate::hls::{self, PlaylistScope, VIDEO_TRACK};

use super::error::{ApiError, ApiResult};
use super::AppState;

const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

/// Only `active` videos exist for the streaming surface.
fn load_active_video(state: &AppState, video_id: &str) -> ApiResult<VideoRecord> {
    let video = state
        .catalog
        .video_by_id(video_id)?
        .ok_or_else(|| ApiError::not_found(format!("video {video_id} not found")))?;
    if video.status != VideoStatus::Active {
        return Err(ApiError::not_found(format!("video {video_id} not found")));
    }
    Ok(video)
}

fn absolute_scope(state: &AppState) -> PlaylistScope {
    PlaylistScope::Absolute {
        base: state.config.base_url(),
    }
}

fn playlist_response(body: String) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, PLAYLIST_CONTENT_TYPE)
        .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
        .body(Body::from(body))
        .expect("playlist response")
}

pub async fn master_playlist(
    State(state): State<AppState>,
    Path(video_id): Path<String>,
) -> ApiResult<Response> {
    let video = load_active_video(&state, &video_id)?;
    let subtitles = state.catalog.subtitles_for_video(&video_id)?;
    let body = hls::master_playlist(&video, &subtitles, &absolute_scope(&state));
    Ok(playlist_response(body))
}

pub async fn media_playlist(
    State(state): State<AppState>,
    Path((video_id, track)): Path<(String, String)>,
) -> ApiResult<Response> {
    if track != VIDEO_TRACK {
        return Err(ApiError::not_found(format!("track {track} not found")));
    }
    let video = load_active_video(&state, &video_id)?;
    let segments = match state.catalog.verify_integrity(&video) {
        Ok(segments) => segments,
        Err(err @ crate::catalog::CatalogError::Integrity { .. }) => {
            // an invariant breach demotes the video so it stops serving
            warn!(target: "server", %video_id, "demoting video: {err}");
            state.catalog.mark_error(&video_id, "INTEGRITY_VIOLATION")?;
            return Err(err.into());
        }
        Err(err) => return Err(err.into()),
    };
    let body = hls::media_playlist(&video_id, &segments, &absolute_scope(&state));
    Ok(playlist_response(body))
}

pub async fn serve_segment(
    State(state): State<AppState>,
    Path((video_id, track, segment)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    if track != VIDEO_TRACK {
        return Err(ApiError::not_found(format!("track {track} not found")));
    }
    load_active_video(&state, &video_id)?;
    let record = state
        .catalog
        .segment_by_filename(&video_id, &segment)?
        .ok_or_else(|| ApiError::not_found(format!("segment {segment} not found")))?;

    let key = SegmentKey::new(&video_id, &segment);
    if let Some(cached) = state.cache.get_cached(&key).await {
        return Ok(full_or_range_response(&cached, headers.get(header::RANGE)));
    }

    // miss: stream through the cache and warm the ordinals behind it
    state.prefetcher.schedule(&video_id, record.ordinal);
    match state
        .fetcher
        .segment_payload(&record, SEGMENT_CONTENT_TYPE)
        .await?
    {
        SegmentPayload::Cached(cached) => {
            Ok(full_or_range_response(&cached, headers.get(header::RANGE)))
        }
        SegmentPayload::Streaming {
            content_type,
            size,
            mut stream,
        } => {
            // wait for the first bytes so fetch errors still map to real
            // status codes; everything after streams as it arrives
            let first = match stream.next().await {
                Some(Ok(chunk)) => Some(chunk),
                Some(Err(err)) => return Err(err.into()),
                None => None,
            };
            let mut builder = Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type)
                .header(header::ACCEPT_RANGES, "bytes")
                .header(header::CACHE_CONTROL, "public, max-age=3600");
            if let Some(size) = size {
                builder = builder.header(header::CONTENT_LENGTH, size);
            }
            let body = match first {
                Some(first) => Body::from_stream(
                    stream::once(async move { Ok::<_, FetchError>(first) }).chain(stream),
                ),
                None => Body::empty(),
            };
            Ok(builder.body(body).expect("segment response"))
        }
    }
}

pub async fn serve_subtitle(
    State(state): State<AppState>,
    Path((video_id, language)): Path<(String, String)>,
) -> ApiResult<Response> {
    load_active_video(&state, &video_id)?;
    let subtitle = state
        .catalog
        .subtitle_by_language(&video_id, &language)?
        .ok_or_else(|| ApiError::not_found(format!("subtitle {language} not found")))?;

    let content_type = subtitle_content_type(&subtitle);
    let key = SegmentKey::new(
        &video_id,
        format!("sub_{}_{}.vtt", subtitle.track_index, subtitle.language),
    );
    let cached = state
        .fetcher
        .blob_bytes(&subtitle.account_id, &subtitle.handle, key, content_type)
        .await?;
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, cached.content_type)
        .header(header::CACHE_CONTROL, "public, max-age=3600")
        .body(Body::from(cached.bytes))
        .expect("subtitle response"))
}

fn subtitle_content_type(subtitle: &SubtitleTrackRecord) -> &'static str {
    match subtitle.codec.as_deref() {
        Some("webvtt") | Some("vtt") => "text/vtt",
        Some("subrip") | Some("srt") => "application/x-subrip",
        _ => "application/octet-stream",
    }
}

/// Serve a fully cached segment, honoring a byte range when one is asked
/// for and valid; malformed ranges fall back to the full body.
fn full_or_range_response(
    cached: &CachedSegment,
    range: Option<&header::HeaderValue>,
) -> Response {
    let total = cached.bytes.len() as u64;
    if let Some(range) = range.and_then(|value| value.to_str().ok()) {
        if let Some((start, end)) = parse_byte_range(range, total) {
            let body = cached.bytes.slice(start as usize..=end as usize);
            return Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_TYPE, cached.content_type.clone())
                .header(header::ACCEPT_RANGES, "bytes")
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {start}-{end}/{total}"),
                )
                .header(header::CONTENT_LENGTH, body.len())
                .header(header::CACHE_CONTROL, "public, max-age=3600")
                .body(Body::from(body))
                .expect("range response");
        }
    }
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, cached.content_type.clone())
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_LENGTH, cached.bytes.len())
        .header(header::CACHE_CONTROL, "public, max-age=3600")
        .body(Body::from(cached.bytes.clone()))
        .expect("segment response")
}

/// Parse a single `bytes=` range into an inclusive `(start, end)` pair.
fn parse_byte_range(raw: &str, total: u64) -> Option<(u64, u64)> {
    if total == 0 {
        return None;
    }
    let spec = raw.strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let (start, end) = spec.split_once('-')?;
    match (start.is_empty(), end.is_empty()) {
        // bytes=-N : final N bytes
        (true, false) => {
            let suffix: u64 = end.parse().ok()?;
            if suffix == 0 {
                return None;
            }
            let start = total.saturating_sub(suffix);
            Some((start, total - 1))
        }
        // bytes=N- : from N to the end
        (false, true) => {
            let start: u64 = start.parse().ok()?;
            if start >= total {
                return None;
            }
            Some((start, total - 1))
        }
        (false, false) => {
            let start: u64 = start.parse().ok()?;
            let end: u64 = end.parse().ok()?;
            if start > end || start >= total {
                return None;
            }
            Some((start, end.min(total - 1)))
        }
        (true, true) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_ranges_parse() {
        assert_eq!(parse_byte_range("bytes=0-99", 1000), Some((0, 99)));
        assert_eq!(parse_byte_range("bytes=500-", 1000), Some((500, 999)));
        assert_eq!(parse_byte_range("bytes=-100", 1000), Some((900, 999)));
        assert_eq!(parse_byte_range("bytes=0-5000", 1000), Some((0, 999)));
    }

    #[test]
    fn invalid_ranges_are_ignored() {
        assert_eq!(parse_byte_range("bytes=900-100", 1000), None);
        assert_eq!(parse_byte_range("bytes=2000-", 1000), None);
        assert_eq!(parse_byte_range("bytes=0-10,20-30", 1000), None);
        assert_eq!(parse_byte_range("items=0-10", 1000), None);
        assert_eq!(parse_byte_range("bytes=-", 1000), None);
        assert_eq!(parse_byte_range("bytes=0-10", 0), None);
    }
}
