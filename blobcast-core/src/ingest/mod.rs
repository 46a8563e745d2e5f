mod jobs;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::catalog::{
    CatalogError, SqliteCatalogStore, SubtitleTrackRecord, VideoRecord, VideoStatus,
};
use crate::config::{AccountConfig, BlobcastConfig};
use crate::distributor::{assign_account, DistributorError, UploadDistributor};
use crate::media::{MediaEngine, TrackKind};
use crate::planner::{PlanError, SegmentPlan, SegmentPlanner};
use crate::remote::{RemoteHandle, RemoteStore};

pub use jobs::{JobPhase, JobProgress, JobRegistry, JobTracker};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("video {0} is already being ingested")]
    Conflict(String),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Upload(#[from] DistributorError),
    #[error("io error at {}: {source}", path.display())]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("ingest cancelled")]
    Cancelled,
}

impl IngestError {
    /// Short reason code persisted on the `videos` row and surfaced to
    /// clients.
    pub fn reason_code(&self) -> &'static str {
        match self {
            IngestError::Conflict(_) => "CONFLICT",
            IngestError::Plan(PlanError::Probe(_)) => "PROBE_FAILED",
            IngestError::Plan(PlanError::NoVideoTrack) => "PROBE_FAILED",
            IngestError::Plan(PlanError::Oversize { .. }) => "PLAN_OVERSIZE",
            IngestError::Plan(_) => "TRANSCODE_FAILED",
            IngestError::Upload(DistributorError::Cancelled) | IngestError::Cancelled => {
                "CANCELLED"
            }
            IngestError::Upload(_) => "UPLOAD_FAILED",
            IngestError::Catalog(_) => "CATALOG_FAILED",
            IngestError::Io { .. } => "IO_FAILED",
        }
    }
}

pub type IngestResult<T> = Result<T, IngestError>;

/// Derive a stable video id from a source filename: lowercased stem with
/// unsafe characters collapsed to `-`.
pub fn sanitize_video_id(filename: &str) -> String {
    let stem = Path::new(filename)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(filename);
    let mut id = String::with_capacity(stem.len());
    let mut last_dash = false;
    for ch in stem.to_lowercase().chars() {
        let mapped = match ch {
            'a'..='z' | '0'..='9' | '.' | '_' | '-' => ch,
            _ => '-',
        };
        if mapped == '-' {
            if last_dash {
                continue;
            }
            last_dash = true;
        } else {
            last_dash = false;
        }
        id.push(mapped);
    }
    let trimmed = id.trim_matches('-').to_string();
    if trimmed.is_empty() {
        "video".to_string()
    } else {
        trimmed
    }
}

/// Orchestrates ingest and delete jobs around the planner, distributor and
/// catalog.
pub struct IngestCoordinator {
    config: Arc<BlobcastConfig>,
    catalog: SqliteCatalogStore,
    engine: Arc<dyn MediaEngine>,
    remote: Arc<dyn RemoteStore>,
    jobs: Arc<JobRegistry>,
    accounts_by_id: HashMap<String, AccountConfig>,
    active: Mutex<HashSet<String>>,
}

impl IngestCoordinator {
    pub fn new(
        config: Arc<BlobcastConfig>,
        catalog: SqliteCatalogStore,
        engine: Arc<dyn MediaEngine>,
        remote: Arc<dyn RemoteStore>,
        jobs: Arc<JobRegistry>,
    ) -> Self {
        let accounts_by_id = config
            .accounts
            .iter()
            .enumerate()
            .map(|(index, account)| (config.account_id(index), account.clone()))
            .collect();
        Self {
            config,
            catalog,
            engine,
            remote,
            jobs,
            accounts_by_id,
            active: Mutex::new(HashSet::new()),
        }
    }

    pub fn jobs(&self) -> &Arc<JobRegistry> {
        &self.jobs
    }

    /// Unique id for a new ingest: sanitized stem, collision-suffixed
    /// against the catalog.
    pub fn derive_video_id(&self, filename: &str) -> IngestResult<String> {
        let base = sanitize_video_id(filename);
        if !self.catalog.video_exists(&base)? {
            return Ok(base);
        }
        for suffix in 2.. {
            let candidate = format!("{base}-{suffix}");
            if !self.catalog.video_exists(&candidate)? {
                return Ok(candidate);
            }
        }
        unreachable!("suffix search is unbounded");
    }

    fn scratch_dir(&self, video_id: &str) -> PathBuf {
        self.config.storage.scratch_dir.join(video_id)
    }

    /// Guard against two concurrent ingests of one id.
    fn claim(&self, video_id: &str) -> IngestResult<()> {
        let mut active = self.active.lock().expect("active set lock");
        if !active.insert(video_id.to_string()) {
            return Err(IngestError::Conflict(video_id.to_string()));
        }
        Ok(())
    }

    fn release(&self, video_id: &str) {
        self.active.lock().expect("active set lock").remove(video_id);
    }

    /// Full ingest pipeline for a received file. `source` is moved into the
    /// scratch directory before any long-running work.
    pub async fn ingest_file(
        &self,
        source: &Path,
        original_filename: &str,
        tracker: &JobTracker,
        cancel: CancellationToken,
    ) -> IngestResult<String> {
        let video_id = match self.derive_video_id(original_filename) {
            Ok(video_id) => video_id,
            Err(err) => {
                tracker.fail(err.reason_code());
                return Err(err);
            }
        };
        if let Err(err) = self.claim(&video_id) {
            tracker.fail(err.reason_code());
            return Err(err);
        }
        let result = self
            .ingest_claimed(source, original_filename, &video_id, tracker, cancel)
            .await;
        self.release(&video_id);
        match result {
            Ok(()) => Ok(video_id),
            Err(err) => {
                tracker.fail(err.reason_code());
                self.cleanup_failed(&video_id, &err).await;
                Err(err)
            }
        }
    }

    async fn ingest_claimed(
        &self,
        source: &Path,
        original_filename: &str,
        video_id: &str,
        tracker: &JobTracker,
        cancel: CancellationToken,
    ) -> IngestResult<()> {
        tracker.set_video(video_id);
        self.catalog
            .insert_video(&VideoRecord::new(video_id, original_filename))?;
        info!(target: "ingest", video_id, "ingest started");

        let scratch = self.scratch_dir(video_id);
        tokio::fs::create_dir_all(&scratch)
            .await
            .map_err(|source| IngestError::Io {
                source,
                path: scratch.clone(),
            })?;
        let staged_source = scratch.join(staged_name(original_filename));
        move_file(source, &staged_source).await?;

        tracker.set_phase(JobPhase::Probing);
        let media = self
            .engine
            .probe(&staged_source)
            .await
            .map_err(|err| IngestError::Plan(PlanError::Probe(err)))?;
        self.catalog.update_media_info(
            video_id,
            &media.container,
            media.video_codec(),
            media.audio_codec(),
            media.duration,
        )?;

        tracker.set_phase(JobPhase::Planning);
        let planner = SegmentPlanner::new(
            Arc::clone(&self.engine),
            self.config.segments.clone(),
            self.config.planner.clone(),
        );
        let plan = planner.plan(video_id, &staged_source, &scratch).await?;

        self.run_distribution(&plan, Some(tracker), &cancel).await?;
        tracker.finish();
        Ok(())
    }

    /// Distribution + subtitles + final commit + scratch cleanup; shared by
    /// fresh ingests and startup resume.
    async fn run_distribution(
        &self,
        plan: &SegmentPlan,
        tracker: Option<&JobTracker>,
        cancel: &CancellationToken,
    ) -> IngestResult<()> {
        let video_id = plan.video_id.as_str();
        if let Some(tracker) = tracker {
            tracker.set_phase(JobPhase::Uploading);
            tracker.set_total_bytes(plan.total_bytes());
        }
        let committed: HashSet<u32> = self
            .catalog
            .segments_for_video(video_id)?
            .iter()
            .map(|segment| segment.ordinal as u32)
            .collect();

        let distributor = UploadDistributor::new(
            Arc::clone(&self.remote),
            self.catalog.clone(),
            self.config.accounts.clone(),
            self.config.account_ids(),
            &self.config.upload,
        );
        distributor
            .distribute(plan, &committed, cancel, |bytes| {
                if let Some(tracker) = tracker {
                    tracker.set_current_bytes(bytes);
                }
            })
            .await?;

        self.upload_subtitles(plan).await?;

        if let Some(tracker) = tracker {
            tracker.set_phase(JobPhase::Committing);
        }
        self.catalog.finalize_video(
            video_id,
            plan.total_duration(),
            plan.segments.len() as i64,
            plan.total_bytes() as i64,
        )?;

        let scratch = self.scratch_dir(video_id);
        if let Err(err) = tokio::fs::remove_dir_all(&scratch).await {
            warn!(target: "ingest", video_id, "failed to clean scratch: {err}");
        }
        info!(
            target: "ingest",
            video_id,
            segments = plan.segments.len(),
            "ingest committed"
        );
        Ok(())
    }

    /// Extract and upload subtitle tracks. Individual track failures are
    /// logged and skipped; the video stays playable without them.
    async fn upload_subtitles(&self, plan: &SegmentPlan) -> IngestResult<()> {
        let video_id = plan.video_id.as_str();
        let existing: HashSet<i64> = self
            .catalog
            .subtitles_for_video(video_id)?
            .iter()
            .map(|track| track.track_index)
            .collect();
        let account_count = self.config.accounts.len();
        let scratch = self.scratch_dir(video_id);

        for track in plan.media.tracks_of(TrackKind::Subtitle) {
            if existing.contains(&(track.type_index as i64)) {
                continue;
            }
            let language = track
                .language
                .clone()
                .unwrap_or_else(|| format!("und{}", track.type_index));
            let vtt_path = scratch.join(format!("sub_{}_{}.vtt", track.type_index, language));
            if let Err(err) = self
                .engine
                .extract_subtitle(&plan.source, track.type_index, &vtt_path)
                .await
            {
                warn!(target: "ingest", video_id, %language, "subtitle extraction failed: {err}");
                continue;
            }
            let bytes = match tokio::fs::read(&vtt_path).await {
                Ok(bytes) => Bytes::from(bytes),
                Err(err) => {
                    warn!(target: "ingest", video_id, %language, "subtitle unreadable: {err}");
                    continue;
                }
            };
            let account_index = assign_account(video_id, track.type_index, account_count);
            let account = &self.config.accounts[account_index];
            let filename = format!("{video_id}_{language}.vtt");
            match self.remote.upload(account, bytes, &filename).await {
                Ok(handle) => {
                    self.catalog.insert_subtitle(&SubtitleTrackRecord {
                        video_id: video_id.to_string(),
                        track_index: track.type_index as i64,
                        language,
                        title: track.title.clone(),
                        codec: Some("webvtt".to_string()),
                        is_default: track.is_default,
                        is_forced: track.is_forced,
                        is_hearing_impaired: track.is_hearing_impaired,
                        handle: handle.to_string(),
                        account_id: self.config.account_id(account_index),
                    })?;
                }
                Err(err) => {
                    warn!(target: "ingest", video_id, %language, "subtitle upload failed: {err}");
                }
            }
        }
        Ok(())
    }

    /// Roll back a failed ingest: remove inserted rows, request remote
    /// deletion of already-uploaded blobs, and mark the video `error`.
    async fn cleanup_failed(&self, video_id: &str, err: &IngestError) {
        error!(target: "ingest", video_id, reason = err.reason_code(), "ingest failed: {err}");
        let uploaded: Vec<(String, String)> = match self.catalog.segments_for_video(video_id) {
            Ok(segments) => segments
                .into_iter()
                .map(|segment| (segment.handle, segment.account_id))
                .collect(),
            Err(catalog_err) => {
                error!(target: "ingest", video_id, "cleanup listing failed: {catalog_err}");
                Vec::new()
            }
        };
        if let Err(catalog_err) = self.catalog.delete_segments(video_id) {
            error!(target: "ingest", video_id, "cleanup delete failed: {catalog_err}");
        }
        if let Err(catalog_err) = self.catalog.mark_error(video_id, err.reason_code()) {
            // the placeholder row may not exist yet (probe failures)
            warn!(target: "ingest", video_id, "could not mark error: {catalog_err}");
        }
        self.remote_delete_handles(uploaded).await;
    }

    /// Delete a video: one transaction removes the rows, then remote blobs
    /// are deleted best-effort in the background. The database is
    /// authoritative; `false` means the video did not exist.
    pub async fn delete_video(&self, video_id: &str) -> IngestResult<bool> {
        let Some(handles) = self.catalog.delete_video(video_id)? else {
            return Ok(false);
        };
        info!(
            target: "ingest",
            video_id,
            blobs = handles.len(),
            "video deleted, scheduling remote cleanup"
        );
        let this = self.clone_for_background();
        tokio::spawn(async move {
            this.remote_delete_handles(handles).await;
        });
        Ok(true)
    }

    fn clone_for_background(&self) -> BackgroundDeleter {
        BackgroundDeleter {
            remote: Arc::clone(&self.remote),
            accounts_by_id: self.accounts_by_id.clone(),
            concurrency: self.config.upload.concurrency,
        }
    }

    async fn remote_delete_handles(&self, handles: Vec<(String, String)>) {
        self.clone_for_background().remote_delete_handles(handles).await;
    }

    /// Startup pass over `processing` videos: a valid scratch directory
    /// resumes distribution, anything else is demoted to `error`.
    pub async fn resume_on_startup(&self, cancel: CancellationToken) -> IngestResult<usize> {
        let stuck = self.catalog.videos_in_status(VideoStatus::Processing)?;
        let mut resumed = 0;
        for video in stuck {
            let scratch = self.scratch_dir(&video.id);
            match SegmentPlan::load(&scratch) {
                Ok(plan) => {
                    info!(target: "ingest", video_id = %video.id, "resuming interrupted ingest");
                    self.claim(&video.id)?;
                    let result = self.run_distribution(&plan, None, &cancel).await;
                    self.release(&video.id);
                    match result {
                        Ok(()) => resumed += 1,
                        Err(err) => self.cleanup_failed(&video.id, &err).await,
                    }
                }
                Err(_) => {
                    warn!(
                        target: "ingest",
                        video_id = %video.id,
                        "no usable scratch state, marking error"
                    );
                    if let Err(err) = self.catalog.mark_error(&video.id, "RESUME_FAILED") {
                        error!(target: "ingest", video_id = %video.id, "mark_error failed: {err}");
                    }
                }
            }
        }
        Ok(resumed)
    }
}

/// Owned slice of the coordinator used by spawned cleanup tasks.
struct BackgroundDeleter {
    remote: Arc<dyn RemoteStore>,
    accounts_by_id: HashMap<String, AccountConfig>,
    concurrency: usize,
}

impl BackgroundDeleter {
    async fn remote_delete_handles(&self, handles: Vec<(String, String)>) {
        stream::iter(handles)
            .map(|(handle, account_id)| async move {
                let Some(account) = self.accounts_by_id.get(&account_id) else {
                    warn!(target: "ingest", %account_id, "cannot delete blob, account unknown");
                    return;
                };
                let parsed: Result<RemoteHandle, _> = handle.parse();
                let Ok(parsed) = parsed else {
                    warn!(target: "ingest", %handle, "cannot delete blob, malformed handle");
                    return;
                };
                if let Err(err) = self.remote.delete(account, &parsed).await {
                    warn!(target: "ingest", %handle, "remote delete failed: {err}");
                }
            })
            .buffer_unordered(self.concurrency.max(1))
            .collect::<Vec<()>>()
            .await;
    }
}

fn staged_name(original_filename: &str) -> String {
    let extension = Path::new(original_filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("bin");
    format!("source.{extension}")
}

async fn move_file(from: &Path, to: &Path) -> IngestResult<()> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    // cross-device fallback
    tokio::fs::copy(from, to)
        .await
        .map_err(|source| IngestError::Io {
            source,
            path: to.to_path_buf(),
        })?;
    if let Err(err) = tokio::fs::remove_file(from).await {
        warn!(target: "ingest", path = %from.display(), "could not remove staged upload: {err}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_ids_are_sanitized() {
        assert_eq!(sanitize_video_id("My Movie (2024).mkv"), "my-movie-2024");
        assert_eq!(sanitize_video_id("Ünïcödé Títle.mp4"), "n-c-d-t-tle");
        assert_eq!(sanitize_video_id("already_safe-name.01.ts"), "already_safe-name.01");
        assert_eq!(sanitize_video_id("???.mp4"), "video");
    }

    #[test]
    fn staged_names_keep_the_extension() {
        assert_eq!(staged_name("movie.mkv"), "source.mkv");
        assert_eq!(staged_name("noext"), "source.bin");
    }
}
