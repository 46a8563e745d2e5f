mod error;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{PlannerSection, SegmentsSection};
use crate::media::{MediaEngine, MediaInfo, SegmentFile, SegmentMode};

pub use error::{PlanError, PlanResult};

pub const PLAN_MANIFEST: &str = "plan.json";

/// One final on-disk segment, densely renumbered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlannedSegment {
    pub ordinal: u32,
    pub filename: String,
    pub path: PathBuf,
    pub duration: f64,
    pub byte_size: u64,
}

/// Output of the planner, persisted as `plan.json` in the scratch directory
/// so a crashed ingest can resume distribution without re-planning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SegmentPlan {
    pub video_id: String,
    pub source: PathBuf,
    pub copy_only: bool,
    /// Nominal target duration the search settled on, seconds.
    pub nominal_duration: f64,
    pub media: MediaInfo,
    pub segments: Vec<PlannedSegment>,
}

impl SegmentPlan {
    pub fn total_duration(&self) -> f64 {
        self.segments.iter().map(|segment| segment.duration).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.segments.iter().map(|segment| segment.byte_size).sum()
    }

    pub fn save(&self, scratch: &Path) -> PlanResult<()> {
        let path = scratch.join(PLAN_MANIFEST);
        let contents = serde_json::to_vec_pretty(self)?;
        std::fs::write(&path, contents).map_err(|source| PlanError::Io { source, path })?;
        Ok(())
    }

    pub fn load(scratch: &Path) -> PlanResult<Self> {
        let path = scratch.join(PLAN_MANIFEST);
        let contents =
            std::fs::read(&path).map_err(|source| PlanError::Io { source, path })?;
        Ok(serde_json::from_slice(&contents)?)
    }
}

/// Descending candidate schedule from `max` to `min`: repeated ×0.8 with
/// integer rounding, always ending at `min`.
pub fn candidate_durations(min: u32, max: u32) -> Vec<u32> {
    let mut candidates = Vec::new();
    let mut current = max.max(min);
    while current > min {
        candidates.push(current);
        let next = ((current as f64) * 0.8).round() as u32;
        current = next.min(current - 1).max(min);
    }
    candidates.push(min);
    candidates
}

pub struct SegmentPlanner {
    engine: Arc<dyn MediaEngine>,
    segments: SegmentsSection,
    planner: PlannerSection,
}

impl SegmentPlanner {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        segments: SegmentsSection,
        planner: PlannerSection,
    ) -> Self {
        Self {
            engine,
            segments,
            planner,
        }
    }

    /// Produce the final segment list for `source` under `scratch`. All
    /// returned segments satisfy the byte cap; re-runs with identical input
    /// and config yield the identical list.
    pub async fn plan(
        &self,
        video_id: &str,
        source: &Path,
        scratch: &Path,
    ) -> PlanResult<SegmentPlan> {
        let media = self
            .engine
            .probe(source)
            .await
            .map_err(PlanError::Probe)?;
        if media.tracks_of(crate::media::TrackKind::Video).next().is_none() {
            return Err(PlanError::NoVideoTrack);
        }
        let cap = self.segments.max_segment_bytes;
        let copy_only = media.copy_compatible();

        let (nominal, mut produced) = if copy_only {
            self.search_copy_duration(source, scratch, cap).await?
        } else {
            // Incompatible bitstreams: one full transcode pass; the encoder
            // owns size compliance at the derived bitrate.
            let nominal = 10.0_f64
                .clamp(self.segments.min_duration as f64, self.segments.max_duration as f64);
            let bitrate = self.target_bitrate(cap, nominal);
            info!(
                target: "planner",
                video_id,
                nominal,
                bitrate,
                "source not copy-compatible, full transcode"
            );
            let out_dir = scratch.join("transcode");
            let segments = self
                .engine
                .segment(source, &out_dir, nominal, SegmentMode::Encode { bitrate_bps: bitrate })
                .await
                .map_err(PlanError::Transcode)?;
            (nominal, segments)
        };

        self.repair_overflow(scratch, cap, nominal, &mut produced)
            .await?;

        let segments = finalize_segments(scratch, produced).await?;
        if let Some(oversize) = segments.iter().find(|segment| segment.byte_size > cap) {
            return Err(PlanError::Oversize {
                ordinal: oversize.ordinal,
                byte_size: oversize.byte_size,
                cap,
            });
        }

        let plan = SegmentPlan {
            video_id: video_id.to_string(),
            source: source.to_path_buf(),
            copy_only,
            nominal_duration: nominal,
            media,
            segments,
        };
        plan.save(scratch)?;
        info!(
            target: "planner",
            video_id,
            segments = plan.segments.len(),
            nominal,
            copy_only,
            "plan complete"
        );
        Ok(plan)
    }

    fn target_bitrate(&self, cap: u64, duration: f64) -> u64 {
        ((cap as f64 * 8.0 * self.planner.safety) / duration) as u64
    }

    /// Copy-only pass over the candidate schedule; returns the chosen
    /// duration and its segment list (which may still contain oversize
    /// segments for the repair step).
    async fn search_copy_duration(
        &self,
        source: &Path,
        scratch: &Path,
        cap: u64,
    ) -> PlanResult<(f64, Vec<SegmentFile>)> {
        let started = Instant::now();
        let budget = Duration::from_secs(self.planner.time_budget_s);
        let mut best: Option<(u32, usize, Vec<SegmentFile>)> = None;

        for candidate in candidate_durations(self.segments.min_duration, self.segments.max_duration)
        {
            if best.is_some() && started.elapsed() > budget {
                warn!(
                    target: "planner",
                    elapsed_s = started.elapsed().as_secs(),
                    "planning budget exhausted, keeping current best"
                );
                break;
            }
            let out_dir = scratch.join(format!("cand_{candidate}"));
            let segments = self
                .engine
                .segment(source, &out_dir, candidate as f64, SegmentMode::Copy)
                .await
                .map_err(PlanError::Transcode)?;
            let oversize = segments
                .iter()
                .filter(|segment| segment.byte_size > cap)
                .count();
            debug!(
                target: "planner",
                candidate,
                segments = segments.len(),
                oversize,
                "copy pass measured"
            );
            // Candidates descend, so `<` keeps the larger duration on ties.
            let better = match &best {
                Some((_, best_oversize, _)) => oversize < *best_oversize,
                None => true,
            };
            if better {
                best = Some((candidate, oversize, segments));
            }
            if oversize == 0 {
                break;
            }
        }

        let (candidate, oversize, segments) =
            best.expect("candidate schedule is never empty");
        if oversize > 0 {
            info!(
                target: "planner",
                candidate,
                oversize,
                "no candidate fits the cap, repairing overflow segments"
            );
        }

        // Drop losing candidate directories; the winner's files move on.
        let keep = scratch.join(format!("cand_{candidate}"));
        prune_candidate_dirs(scratch, &keep).await;

        Ok((candidate as f64, segments))
    }

    /// Re-encode every still-oversize segment; a segment that resists
    /// re-encoding is split in two at half the nominal duration, once.
    async fn repair_overflow(
        &self,
        scratch: &Path,
        cap: u64,
        nominal: f64,
        segments: &mut Vec<SegmentFile>,
    ) -> PlanResult<()> {
        let bitrate = self.target_bitrate(cap, nominal);
        let mut repaired: Vec<SegmentFile> = Vec::with_capacity(segments.len());

        for segment in segments.drain(..) {
            if segment.byte_size <= cap {
                repaired.push(segment);
                continue;
            }
            let reencoded_path = segment.path.with_extension("reenc.ts");
            let new_size = self
                .engine
                .reencode(&segment.path, &reencoded_path, bitrate)
                .await
                .map_err(PlanError::Transcode)?;
            if new_size <= cap {
                repaired.push(SegmentFile {
                    path: reencoded_path,
                    byte_size: new_size,
                    ..segment
                });
                continue;
            }

            let half = nominal / 2.0;
            let split_dir = scratch.join(format!("split_{:05}", segment.ordinal));
            let split_bitrate = self.target_bitrate(cap, half);
            debug!(
                target: "planner",
                ordinal = segment.ordinal,
                half,
                "re-encoded segment still oversize, splitting"
            );
            let parts = self
                .engine
                .segment(
                    &segment.path,
                    &split_dir,
                    half,
                    SegmentMode::Encode { bitrate_bps: split_bitrate },
                )
                .await
                .map_err(PlanError::Transcode)?;
            for part in &parts {
                if part.byte_size > cap {
                    return Err(PlanError::Oversize {
                        ordinal: segment.ordinal,
                        byte_size: part.byte_size,
                        cap,
                    });
                }
            }
            repaired.extend(parts);
        }

        *segments = repaired;
        Ok(())
    }
}

/// Move the chosen files into `scratch/final/` with dense ordinals and
/// canonical names.
async fn finalize_segments(
    scratch: &Path,
    produced: Vec<SegmentFile>,
) -> PlanResult<Vec<PlannedSegment>> {
    let final_dir = scratch.join("final");
    tokio::fs::create_dir_all(&final_dir)
        .await
        .map_err(|source| PlanError::Io {
            source,
            path: final_dir.clone(),
        })?;

    let mut segments = Vec::with_capacity(produced.len());
    for (ordinal, segment) in produced.into_iter().enumerate() {
        let ordinal = ordinal as u32;
        let filename = crate::catalog::segment_filename(ordinal);
        let path = final_dir.join(&filename);
        tokio::fs::rename(&segment.path, &path)
            .await
            .map_err(|source| PlanError::Io {
                source,
                path: segment.path.clone(),
            })?;
        segments.push(PlannedSegment {
            ordinal,
            filename,
            path,
            duration: segment.duration,
            byte_size: segment.byte_size,
        });
    }
    Ok(segments)
}

async fn prune_candidate_dirs(scratch: &Path, keep: &Path) {
    let Ok(mut entries) = tokio::fs::read_dir(scratch).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path == keep {
            continue;
        }
        let is_candidate = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.starts_with("cand_"))
            .unwrap_or(false);
        if is_candidate {
            let _ = tokio::fs::remove_dir_all(&path).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeEngine;
    use tempfile::TempDir;

    fn sections(cap: u64, min: u32, max: u32) -> (SegmentsSection, PlannerSection) {
        (
            SegmentsSection {
                max_segment_bytes: cap,
                min_duration: min,
                max_duration: max,
            },
            PlannerSection {
                time_budget_s: 600,
                safety: 0.9,
            },
        )
    }

    fn planner(engine: Arc<FakeEngine>, cap: u64) -> SegmentPlanner {
        let (segments, planner) = sections(cap, 2, 30);
        SegmentPlanner::new(engine, segments, planner)
    }

    #[test]
    fn candidate_schedule_descends_to_min() {
        let schedule = candidate_durations(2, 30);
        assert_eq!(schedule.first(), Some(&30));
        assert_eq!(schedule.last(), Some(&2));
        assert!(schedule.windows(2).all(|pair| pair[0] > pair[1]));
        // deterministic
        assert_eq!(schedule, candidate_durations(2, 30));
    }

    #[test]
    fn candidate_schedule_degenerate_range() {
        assert_eq!(candidate_durations(5, 5), vec![5]);
        assert_eq!(candidate_durations(4, 5), vec![5, 4]);
    }

    #[tokio::test]
    async fn copy_only_source_fits_without_reencode() {
        // 10 Mbps, 60 s: at 10 s per segment a segment is ~12.5 MB < 15 MiB.
        let temp = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine::new(10_000_000, 60.0));
        let source = engine.write_source(temp.path(), "sample.mp4");
        let planner = planner(engine.clone(), 15 * 1024 * 1024);

        let plan = planner
            .plan("sample", &source, temp.path())
            .await
            .unwrap();
        assert!(plan.copy_only);
        assert!(plan.segments.len() >= 5 && plan.segments.len() <= 10);
        assert!(plan
            .segments
            .iter()
            .all(|segment| segment.byte_size <= 15 * 1024 * 1024));
        assert_eq!(engine.reencode_calls(), 0);
        // dense ordinals with derived names
        for (index, segment) in plan.segments.iter().enumerate() {
            assert_eq!(segment.ordinal as usize, index);
            assert_eq!(segment.filename, crate::catalog::segment_filename(segment.ordinal));
        }
        assert!((plan.total_duration() - 60.0).abs() < 0.5);
    }

    #[tokio::test]
    async fn high_bitrate_source_gets_reencoded() {
        // 50 Mbps: even 2 s copy segments are ~12.5 MB, but the fake skews
        // one segment oversize to force the repair path.
        let temp = TempDir::new().unwrap();
        let engine = Arc::new(
            FakeEngine::new(50_000_000, 120.0).with_oversize_ordinal(1),
        );
        let source = engine.write_source(temp.path(), "high.mp4");
        let planner = planner(engine.clone(), 15 * 1024 * 1024);

        let plan = planner.plan("high", &source, temp.path()).await.unwrap();
        assert!(engine.reencode_calls() >= 1);
        assert!(plan
            .segments
            .iter()
            .all(|segment| segment.byte_size <= 15 * 1024 * 1024));
    }

    #[tokio::test]
    async fn incompatible_codec_takes_transcode_path() {
        let temp = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine::new(8_000_000, 30.0).with_video_codec("mpeg2video"));
        let source = engine.write_source(temp.path(), "legacy.mpg");
        let planner = planner(engine.clone(), 15 * 1024 * 1024);

        let plan = planner.plan("legacy", &source, temp.path()).await.unwrap();
        assert!(!plan.copy_only);
        assert!(engine.encode_segment_calls() >= 1);
    }

    #[tokio::test]
    async fn planner_is_deterministic() {
        let cap = 15 * 1024 * 1024;
        let mut runs = Vec::new();
        for _ in 0..2 {
            let temp = TempDir::new().unwrap();
            let engine = Arc::new(FakeEngine::new(10_000_000, 60.0));
            let source = engine.write_source(temp.path(), "sample.mp4");
            let plan = planner(engine, cap)
                .plan("sample", &source, temp.path())
                .await
                .unwrap();
            runs.push(
                plan.segments
                    .iter()
                    .map(|segment| (segment.ordinal, segment.duration, segment.byte_size))
                    .collect::<Vec<_>>(),
            );
        }
        assert_eq!(runs[0], runs[1]);
    }

    #[tokio::test]
    async fn manifest_roundtrip() {
        let temp = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine::new(10_000_000, 60.0));
        let source = engine.write_source(temp.path(), "sample.mp4");
        let plan = planner(engine, 15 * 1024 * 1024)
            .plan("sample", &source, temp.path())
            .await
            .unwrap();
        let loaded = SegmentPlan::load(temp.path()).unwrap();
        assert_eq!(plan, loaded);
    }
}
