//! End-to-end ingest, delete and resume flows against the scripted media
//! engine and the in-memory remote store.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use blobcast_core::catalog::VideoStatus;
use blobcast_core::config::{BlobcastConfig, CacheKind};
use blobcast_core::distributor::assign_account;
use blobcast_core::ingest::IngestError;
use blobcast_core::planner::SegmentPlanner;
use blobcast_core::server::AppState;
use blobcast_core::testing::{test_accounts, FakeEngine, FakeRemote};
use blobcast_core::{MediaEngine, RemoteStore, VideoRecord};

const CAP: u64 = 15 * 1024 * 1024;

fn test_config(temp: &TempDir, accounts: usize) -> BlobcastConfig {
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
    config.segments.max_segment_bytes = CAP;
    config.cache.kind = CacheKind::Memory;
    config.upload.concurrency = 4;
    config
}

struct Fixture {
    _temp: TempDir,
    state: AppState,
    engine: Arc<FakeEngine>,
    remote: Arc<FakeRemote>,
}

fn fixture_with(engine: FakeEngine, accounts: usize) -> Fixture {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp, accounts);
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
        engine,
        remote,
    }
}

fn write_source(fixture: &Fixture, name: &str) -> PathBuf {
    let dir = fixture.state.config.storage.data_dir.join("sources");
    std::fs::create_dir_all(&dir).unwrap();
    fixture.engine.write_source(&dir, name)
}

async fn ingest(fixture: &Fixture, name: &str) -> Result<String, IngestError> {
    let source = write_source(fixture, name);
    let tracker = fixture.state.jobs.create();
    fixture
        .state
        .ingest
        .ingest_file(&source, name, &tracker, CancellationToken::new())
        .await
}

#[tokio::test]
async fn ingest_sample_meets_all_invariants() {
    // ≈75 MiB, 10 Mbps, 60 s with a 15 MiB cap: copy-only, 5..10 segments
    let fixture = fixture_with(FakeEngine::new(10_000_000, 60.0), 1);
    let video_id = ingest(&fixture, "sample_60s_10Mbps.mp4").await.unwrap();

    let video = fixture.state.catalog.video_by_id(&video_id).unwrap().unwrap();
    assert_eq!(video.status, VideoStatus::Active);
    assert!((5..=10).contains(&(video.total_segments as usize)));

    let segments = fixture.state.catalog.verify_integrity(&video).unwrap();
    assert_eq!(segments.len() as i64, video.total_segments);
    for (index, segment) in segments.iter().enumerate() {
        assert_eq!(segment.ordinal, index as i64);
        assert!(segment.byte_size as u64 <= CAP);
        assert_eq!(segment.account_id, "acct1");
    }
    let total: f64 = segments.iter().map(|segment| segment.duration).sum();
    assert!((total - video.duration).abs() <= 0.5);
    assert_eq!(fixture.engine.reencode_calls(), 0);

    // scratch is cleaned after commit
    let scratch = fixture.state.config.storage.scratch_dir.join(&video_id);
    assert!(!scratch.exists());
}

#[tokio::test]
async fn segments_sweep_across_three_accounts() {
    let fixture = fixture_with(FakeEngine::new(10_000_000, 60.0), 3);
    let video_id = ingest(&fixture, "sample_60s_10Mbps.mp4").await.unwrap();

    let segments = fixture.state.catalog.segments_for_video(&video_id).unwrap();
    let ids: Vec<String> = (0..3).map(|i| format!("acct{}", i + 1)).collect();
    for segment in &segments {
        let expected = assign_account(&video_id, segment.ordinal as usize, 3);
        assert_eq!(segment.account_id, ids[expected]);
    }
    // every account received roughly its share
    for id in 1..=3 {
        assert!(fixture.remote.upload_count(&format!("@store_{id}")) > 0);
    }
}

#[tokio::test]
async fn high_bitrate_source_is_repaired_under_the_cap() {
    let engine = FakeEngine::new(50_000_000, 120.0).with_oversize_ordinal(0);
    let fixture = fixture_with(engine, 1);
    let video_id = ingest(&fixture, "high_bitrate_2min.mp4").await.unwrap();

    let video = fixture.state.catalog.video_by_id(&video_id).unwrap().unwrap();
    assert_eq!(video.status, VideoStatus::Active);
    assert!(fixture.engine.reencode_calls() >= 1);
    for segment in fixture.state.catalog.segments_for_video(&video_id).unwrap() {
        assert!(segment.byte_size as u64 <= CAP);
    }
}

#[tokio::test]
async fn transient_upload_failures_are_retried() {
    let fixture = fixture_with(FakeEngine::new(10_000_000, 60.0), 1);
    fixture.remote.fail_next_uploads(2);
    let video_id = ingest(&fixture, "flaky.mp4").await.unwrap();
    let video = fixture.state.catalog.video_by_id(&video_id).unwrap().unwrap();
    assert_eq!(video.status, VideoStatus::Active);
}

#[tokio::test]
async fn exhausted_retries_fail_the_ingest_and_clean_up() {
    let fixture = fixture_with(FakeEngine::new(10_000_000, 60.0), 1);
    fixture.remote.fail_next_uploads(1000);
    let err = ingest(&fixture, "doomed.mp4").await.unwrap_err();
    assert_eq!(err.reason_code(), "UPLOAD_FAILED");

    let video = fixture.state.catalog.video_by_id("doomed").unwrap().unwrap();
    assert_eq!(video.status, VideoStatus::Error);
    assert_eq!(video.error_reason.as_deref(), Some("UPLOAD_FAILED"));
    assert!(fixture
        .state
        .catalog
        .segments_for_video("doomed")
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn subtitles_are_extracted_and_recorded() {
    let engine = FakeEngine::new(10_000_000, 60.0).with_subtitle("eng", "English");
    let fixture = fixture_with(engine, 2);
    let video_id = ingest(&fixture, "subtitled.mkv").await.unwrap();

    let tracks = fixture.state.catalog.subtitles_for_video(&video_id).unwrap();
    assert_eq!(tracks.len(), 1);
    assert_eq!(tracks[0].language, "eng");
    assert!(tracks[0].is_default);
    assert_eq!(
        tracks[0].account_id,
        format!("acct{}", assign_account(&video_id, 0, 2) + 1)
    );
}

#[tokio::test]
async fn repeated_filenames_get_collision_suffixes() {
    let fixture = fixture_with(FakeEngine::new(10_000_000, 30.0), 1);
    let first = ingest(&fixture, "movie.mp4").await.unwrap();
    let second = ingest(&fixture, "movie.mp4").await.unwrap();
    assert_eq!(first, "movie");
    assert_eq!(second, "movie-2");
}

#[tokio::test]
async fn concurrent_ingest_of_one_id_is_a_conflict() {
    let fixture = fixture_with(FakeEngine::new(10_000_000, 30.0), 1);
    fixture
        .engine
        .set_probe_delay(Some(Duration::from_millis(300)));

    let source_a = write_source(&fixture, "same.mp4");
    let tracker_a = fixture.state.jobs.create();
    let ingest_a = {
        let state = fixture.state.clone();
        tokio::spawn(async move {
            state
                .ingest
                .ingest_file(&source_a, "same.mp4", &tracker_a, CancellationToken::new())
                .await
        })
    };
    // let the first ingest claim the id and park in probing
    tokio::time::sleep(Duration::from_millis(50)).await;

    let source_b = write_source(&fixture, "same-b.mp4");
    let tracker_b = fixture.state.jobs.create();
    let err = fixture
        .state
        .ingest
        .ingest_file(&source_b, "same.mp4", &tracker_b, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Conflict(_)));

    fixture.engine.set_probe_delay(None);
    ingest_a.await.unwrap().unwrap();
}

#[tokio::test]
async fn delete_removes_rows_and_schedules_remote_cleanup() {
    let fixture = fixture_with(FakeEngine::new(10_000_000, 60.0), 2);
    let video_id = ingest(&fixture, "short-lived.mp4").await.unwrap();
    let uploaded = fixture.remote.stored_count();
    assert!(uploaded > 0);

    assert!(fixture.state.ingest.delete_video(&video_id).await.unwrap());
    assert!(fixture.state.catalog.video_by_id(&video_id).unwrap().is_none());
    // second delete: nothing left
    assert!(!fixture.state.ingest.delete_video(&video_id).await.unwrap());

    // remote cleanup is best-effort and async; wait for it
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while fixture.remote.deleted_handles().len() < uploaded {
        assert!(
            tokio::time::Instant::now() < deadline,
            "remote cleanup never ran"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(fixture.remote.stored_count(), 0);
}

#[tokio::test]
async fn startup_resume_finishes_an_interrupted_ingest() {
    let fixture = fixture_with(FakeEngine::new(10_000_000, 60.0), 1);

    // simulate a crash after planning: row in processing, plan on disk,
    // nothing distributed
    let scratch = fixture.state.config.storage.scratch_dir.join("wounded");
    std::fs::create_dir_all(&scratch).unwrap();
    let source = fixture.engine.write_source(&scratch, "source.mp4");
    let planner = SegmentPlanner::new(
        Arc::clone(&fixture.engine) as Arc<dyn MediaEngine>,
        fixture.state.config.segments.clone(),
        fixture.state.config.planner.clone(),
    );
    let plan = planner.plan("wounded", &source, &scratch).await.unwrap();
    assert!(!plan.segments.is_empty());
    let mut row = VideoRecord::new("wounded", "wounded.mp4");
    row.duration = 60.0;
    fixture.state.catalog.insert_video(&row).unwrap();

    let resumed = fixture
        .state
        .ingest
        .resume_on_startup(CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(resumed, 1);

    let video = fixture.state.catalog.video_by_id("wounded").unwrap().unwrap();
    assert_eq!(video.status, VideoStatus::Active);
    fixture.state.catalog.verify_integrity(&video).unwrap();
}

#[tokio::test]
async fn startup_resume_demotes_videos_without_scratch() {
    let fixture = fixture_with(FakeEngine::new(10_000_000, 60.0), 1);
    fixture
        .state
        .catalog
        .insert_video(&VideoRecord::new("lost", "lost.mp4"))
        .unwrap();

    let resumed = fixture
        .state
        .ingest
        .resume_on_startup(CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(resumed, 0);

    let video = fixture.state.catalog.video_by_id("lost").unwrap().unwrap();
    assert_eq!(video.status, VideoStatus::Error);
    assert_eq!(video.error_reason.as_deref(), Some("RESUME_FAILED"));
}

#[tokio::test]
async fn resume_skips_already_committed_segments() {
    let fixture = fixture_with(FakeEngine::new(10_000_000, 60.0), 1);

    let scratch = fixture.state.config.storage.scratch_dir.join("partial");
    std::fs::create_dir_all(&scratch).unwrap();
    let source = fixture.engine.write_source(&scratch, "source.mp4");
    let planner = SegmentPlanner::new(
        Arc::clone(&fixture.engine) as Arc<dyn MediaEngine>,
        fixture.state.config.segments.clone(),
        fixture.state.config.planner.clone(),
    );
    let plan = planner.plan("partial", &source, &scratch).await.unwrap();
    fixture
        .state
        .catalog
        .insert_video(&VideoRecord::new("partial", "partial.mp4"))
        .unwrap();

    // first segment already made it before the "crash"
    let account = &fixture.state.config.accounts[0];
    let first = &plan.segments[0];
    let bytes = std::fs::read(&first.path).unwrap();
    let handle = fixture
        .remote
        .upload(account, bytes.into(), &first.filename)
        .await
        .unwrap();
    fixture
        .state
        .catalog
        .insert_segment(&blobcast_core::SegmentRecord {
            video_id: "partial".to_string(),
            ordinal: 0,
            filename: first.filename.clone(),
            duration: first.duration,
            byte_size: first.byte_size as i64,
            handle: handle.to_string(),
            account_id: "acct1".to_string(),
            created_at: None,
        })
        .unwrap();
    let uploads_before = fixture.remote.upload_count("@store_1");

    let resumed = fixture
        .state
        .ingest
        .resume_on_startup(CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(resumed, 1);

    let video = fixture.state.catalog.video_by_id("partial").unwrap().unwrap();
    assert_eq!(video.status, VideoStatus::Active);
    let segments = fixture.state.catalog.verify_integrity(&video).unwrap();
    assert_eq!(segments.len(), plan.segments.len());
    // ordinal 0 was not re-uploaded
    let uploads_after = fixture.remote.upload_count("@store_1");
    assert_eq!(
        uploads_after - uploads_before,
        plan.segments.len() - 1
    );
}

#[tokio::test]
async fn unsupported_codecs_are_transcoded_end_to_end() {
    let engine = FakeEngine::new(8_000_000, 30.0).with_video_codec("vp9");
    let fixture = fixture_with(engine, 1);
    let video_id = ingest(&fixture, "webm-ish.webm").await.unwrap();
    let video = fixture.state.catalog.video_by_id(&video_id).unwrap().unwrap();
    assert_eq!(video.status, VideoStatus::Active);
    assert!(fixture.engine.encode_segment_calls() >= 1);

    let ordinals: HashSet<i64> = fixture
        .state
        .catalog
        .segments_for_video(&video_id)
        .unwrap()
        .iter()
        .map(|segment| segment.ordinal)
        .collect();
    assert_eq!(ordinals.len() as i64, video.total_segments);
}
