//! Route-level tests over the axum router with the scripted fakes behind
//! the application state.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use serde_json::Value;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use blobcast_core::config::{BlobcastConfig, CacheKind};
use blobcast_core::server::{router, AppState};
use blobcast_core::testing::{test_accounts, FakeEngine, FakeRemote};
use blobcast_core::{MediaEngine, RemoteHandle, RemoteStore};

struct Fixture {
    _temp: TempDir,
    state: AppState,
    remote: Arc<FakeRemote>,
    engine: Arc<FakeEngine>,
}

fn fixture_with(engine: FakeEngine, accounts: usize) -> Fixture {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("data");
    let mut config = BlobcastConfig {
        server: Default::default(),
        storage: Default::default(),
        segments: Default::default(),
        planner: Default::default(),
        cache: Default::default(),
        upload: Default::default(),
        media: Default::default(),
        accounts: test_accounts(accounts),
    };
    config.storage.data_dir = root.clone();
    config.storage.scratch_dir = root.join("scratch");
    config.storage.cache_dir = root.join("cache");
    config.storage.database_path = root.join("catalog.sqlite");
    config.cache.kind = CacheKind::Memory;

    let engine = Arc::new(engine);
    let remote = Arc::new(FakeRemote::new());
    let state = AppState::new(
        config,
        Arc::clone(&engine) as Arc<dyn MediaEngine>,
        Arc::clone(&remote) as Arc<dyn RemoteStore>,
    )
    .unwrap();
    Fixture {
        _temp: temp,
        state,
        remote,
        engine,
    }
}

fn fixture() -> Fixture {
    fixture_with(FakeEngine::new(10_000_000, 60.0), 2)
}

async fn ingest(fixture: &Fixture, name: &str) -> String {
    let dir = fixture.state.config.storage.data_dir.join("sources");
    std::fs::create_dir_all(&dir).unwrap();
    let source = fixture.engine.write_source(&dir, name);
    let tracker = fixture.state.jobs.create();
    fixture
        .state
        .ingest
        .ingest_file(&source, name, &tracker, CancellationToken::new())
        .await
        .unwrap()
}

async fn get(fixture: &Fixture, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = router(fixture.state.clone())
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

async fn get_json(fixture: &Fixture, uri: &str) -> (StatusCode, Value) {
    let (status, body) = get(fixture, uri).await;
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

#[tokio::test]
async fn video_listing_and_detail() {
    let fx = fixture();
    let video_id = ingest(&fx, "catalog-test.mp4").await;

    let (status, json) = get_json(&fx, "/api/videos").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["total"], 1);
    assert_eq!(json["videos"][0]["id"], video_id.as_str());
    assert_eq!(json["videos"][0]["status"], "active");

    let (status, json) = get_json(&fx, &format!("/api/videos/{video_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(json["segments"].as_u64().unwrap() >= 5);

    let (status, json) = get_json(&fx, "/api/videos/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"], "NOT_FOUND");
}

#[tokio::test]
async fn status_filter_hides_processing_videos() {
    let fx = fixture();
    ingest(&fx, "visible.mp4").await;
    fx.state
        .catalog
        .insert_video(&blobcast_core::VideoRecord::new("pending", "pending.mp4"))
        .unwrap();

    let (_, json) = get_json(&fx, "/api/videos?status=active").await;
    assert_eq!(json["total"], 1);
    let (_, json) = get_json(&fx, "/api/videos?status=processing").await;
    assert_eq!(json["total"], 1);
    let (status, json) = get_json(&fx, "/api/videos?status=bogus").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "BAD_REQUEST");
}

#[tokio::test]
async fn playlists_are_served_and_stable() {
    let fx = fixture();
    let video_id = ingest(&fx, "playlist-test.mp4").await;

    let (status, master) = get(&fx, &format!("/hls/{video_id}/master.m3u8")).await;
    assert_eq!(status, StatusCode::OK);
    let master = String::from_utf8(master).unwrap();
    assert!(master.starts_with("#EXTM3U"));
    assert!(master.contains("#EXT-X-STREAM-INF"));
    assert!(master.contains(&format!("/hls/{video_id}/video/playlist.m3u8")));

    let uri = format!("/hls/{video_id}/video/playlist.m3u8");
    let (status, first) = get(&fx, &uri).await;
    assert_eq!(status, StatusCode::OK);
    let (_, second) = get(&fx, &uri).await;
    assert_eq!(first, second, "two playlist fetches must be byte-identical");

    let media = String::from_utf8(first).unwrap();
    assert!(media.contains("#EXT-X-ENDLIST"));
    assert!(media.contains("segment_00000.ts"));

    // playlists for processing/unknown videos do not exist
    let (status, _) = get(&fx, "/hls/ghost/master.m3u8").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn segments_round_trip_byte_for_byte() {
    let fx = fixture();
    let video_id = ingest(&fx, "roundtrip.mp4").await;
    let segments = fx.state.catalog.segments_for_video(&video_id).unwrap();

    for segment in &segments {
        let (status, body) = get(
            &fx,
            &format!("/hls/{video_id}/video/{}", segment.filename),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let handle: RemoteHandle = segment.handle.parse().unwrap();
        let uploaded = fx.remote.stored_bytes(&handle.file_id).unwrap();
        assert_eq!(body, uploaded, "segment {} differs", segment.ordinal);
    }

    let (status, _) = get(&fx, &format!("/hls/{video_id}/video/segment_99999.ts")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cached_segments_serve_ranges() {
    let fx = fixture();
    let video_id = ingest(&fx, "ranged.mp4").await;
    let segment = &fx.state.catalog.segments_for_video(&video_id).unwrap()[0];
    let uri = format!("/hls/{video_id}/video/{}", segment.filename);

    // first fetch warms the cache
    let (status, full) = get(&fx, &uri).await;
    assert_eq!(status, StatusCode::OK);

    let response = router(fx.state.clone())
        .oneshot(
            Request::get(&uri)
                .header(header::RANGE, "bytes=0-3")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    let content_range = response
        .headers()
        .get(header::CONTENT_RANGE)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(content_range, format!("bytes 0-3/{}", full.len()));
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], &full[..4]);
}

#[tokio::test]
async fn sequential_playback_prefetches_ahead() {
    let fx = fixture();
    let video_id = ingest(&fx, "warmup.mp4").await;
    let segments = fx.state.catalog.segments_for_video(&video_id).unwrap();
    assert!(segments.len() >= 4);

    // cold fetch of segment 0 schedules the ordinals behind it
    let (status, _) = get(
        &fx,
        &format!("/hls/{video_id}/video/{}", segments[0].filename),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let mut warmed = true;
        for segment in segments.iter().take(4).skip(1) {
            let key = blobcast_core::SegmentKey::new(&video_id, &segment.filename);
            if !fx.state.cache.present_or_inflight(&key).await {
                warmed = false;
            }
        }
        if warmed {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "prefetch did not warm the next segments"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let stats = fx.state.cache.stats().await;
    assert!(stats.prefetch_success >= 3);
}

#[tokio::test]
async fn offline_account_yields_503_without_fallback() {
    let fx = fixture();
    let video_id = ingest(&fx, "outage.mp4").await;
    let segments = fx.state.catalog.segments_for_video(&video_id).unwrap();

    // find a segment recorded against account 2 and take it offline
    let victim = segments
        .iter()
        .find(|segment| segment.account_id == "acct2")
        .expect("two accounts must both hold segments");
    fx.remote.set_offline("@store_2", true);

    let (status, body) = get(
        &fx,
        &format!("/hls/{video_id}/video/{}", victim.filename),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"], "ACCOUNT_UNAVAILABLE");
    // isolation: the victim's blob was never tried through another account
    // (prefetch may legitimately touch other segments on account 1)
    let victim_handle: RemoteHandle = victim.handle.parse().unwrap();
    assert!(fx
        .remote
        .download_log()
        .iter()
        .all(|(chat, file_id)| *file_id != victim_handle.file_id || chat == "@store_2"));
}

#[tokio::test]
async fn delete_is_idempotent_over_http() {
    let fx = fixture();
    let video_id = ingest(&fx, "deleteme.mp4").await;

    let app = router(fx.state.clone());
    let response = app
        .oneshot(
            Request::delete(format!("/api/videos/{video_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let (status, _) = get(&fx, &format!("/hls/{video_id}/master.m3u8")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let response = router(fx.state.clone())
        .oneshot(
            Request::delete(format!("/api/videos/{video_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    assert!(fx.state.catalog.video_by_id(&video_id).unwrap().is_none());
    assert!(fx
        .state
        .catalog
        .segments_for_video(&video_id)
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn subtitles_are_served_with_their_mime() {
    let engine = FakeEngine::new(10_000_000, 60.0).with_subtitle("eng", "English");
    let fx = fixture_with(engine, 2);
    let video_id = ingest(&fx, "subs.mkv").await;

    let response = router(fx.state.clone())
        .oneshot(
            Request::get(format!("/hls/{video_id}/subtitles/eng"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "text/vtt"
    );
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert!(body.starts_with(b"WEBVTT"));

    let (status, _) = get(&fx, &format!("/hls/{video_id}/subtitles/kor")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn master_playlist_advertises_subtitles() {
    let engine = FakeEngine::new(10_000_000, 60.0).with_subtitle("ger", "German");
    let fx = fixture_with(engine, 1);
    let video_id = ingest(&fx, "subs2.mkv").await;

    let (status, body) = get(&fx, &format!("/hls/{video_id}/master.m3u8")).await;
    assert_eq!(status, StatusCode::OK);
    let master = String::from_utf8(body).unwrap();
    assert!(master.contains("TYPE=SUBTITLES"));
    assert!(master.contains("LANGUAGE=\"ger\""));
    assert!(master.contains(&format!("/hls/{video_id}/subtitles/ger")));
}

#[tokio::test]
async fn cache_stats_and_clear_endpoints() {
    let fx = fixture();
    let video_id = ingest(&fx, "stats.mp4").await;
    let segment = &fx.state.catalog.segments_for_video(&video_id).unwrap()[0];
    get(&fx, &format!("/hls/{video_id}/video/{}", segment.filename)).await;

    let (status, json) = get_json(&fx, "/api/system/cache/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert!(json["misses"].as_u64().unwrap() >= 1);
    assert!(json["entries"].as_u64().unwrap() >= 1);

    let response = router(fx.state.clone())
        .oneshot(
            Request::post("/api/system/cache/clear")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let (_, json) = get_json(&fx, "/api/system/cache/stats").await;
    assert_eq!(json["entries"], 0);
    assert_eq!(json["current_bytes"], 0);
}

#[tokio::test]
async fn multipart_upload_runs_the_ingest_pipeline() {
    let fx = fixture();

    let boundary = "blobcast-test-boundary";
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(
        b"Content-Disposition: form-data; name=\"file\"; filename=\"posted.mp4\"\r\n",
    );
    body.extend_from_slice(b"Content-Type: video/mp4\r\n\r\n");
    body.extend_from_slice(b"fake source container");
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

    let response = router(fx.state.clone())
        .oneshot(
            Request::post("/api/upload")
                .header(
                    header::CONTENT_TYPE,
                    format!("multipart/form-data; boundary={boundary}"),
                )
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    let job = json["job"].as_str().unwrap().to_string();

    // poll progress until the background ingest lands
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let (status, json) = get_json(&fx, &format!("/api/upload/{job}/progress")).await;
        assert_eq!(status, StatusCode::OK);
        match json["phase"].as_str().unwrap() {
            "done" => break,
            "error" => panic!("ingest failed: {json}"),
            _ => {}
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "upload job never finished"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let video = fx.state.catalog.video_by_id("posted").unwrap().unwrap();
    assert_eq!(video.status, blobcast_core::VideoStatus::Active);

    let (status, json) = get_json(&fx, "/api/upload/job-999999/progress").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"], "NOT_FOUND");
}
