use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::TranscodeResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Video,
    Audio,
    Subtitle,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackInfo {
    /// Global stream index as reported by the prober.
    pub index: i64,
    /// Position among streams of the same kind (`0:s:<type_index>`).
    pub type_index: usize,
    pub kind: TrackKind,
    pub codec: String,
    pub language: Option<String>,
    pub title: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub bitrate: Option<u64>,
    pub is_default: bool,
    pub is_forced: bool,
    pub is_hearing_impaired: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaInfo {
    pub container: String,
    pub duration: f64,
    pub byte_size: u64,
    /// Overall bitrate in bits per second.
    pub bitrate: u64,
    pub tracks: Vec<TrackInfo>,
}

const HLS_VIDEO_CODECS: &[&str] = &["h264", "hevc", "h265"];
const HLS_AUDIO_CODECS: &[&str] = &["aac", "mp3", "ac3", "eac3"];

impl MediaInfo {
    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &TrackInfo> {
        self.tracks.iter().filter(move |track| track.kind == kind)
    }

    pub fn video_codec(&self) -> Option<&str> {
        self.tracks_of(TrackKind::Video)
            .next()
            .map(|track| track.codec.as_str())
    }

    pub fn audio_codec(&self) -> Option<&str> {
        self.tracks_of(TrackKind::Audio)
            .next()
            .map(|track| track.codec.as_str())
    }

    /// Whether the source bitstreams can be carried into transport-stream
    /// segments without re-encoding.
    pub fn copy_compatible(&self) -> bool {
        let video_ok = self
            .tracks_of(TrackKind::Video)
            .all(|track| HLS_VIDEO_CODECS.contains(&track.codec.as_str()));
        let audio_ok = self
            .tracks_of(TrackKind::Audio)
            .all(|track| HLS_AUDIO_CODECS.contains(&track.codec.as_str()));
        self.tracks_of(TrackKind::Video).next().is_some() && video_ok && audio_ok
    }
}

/// One segment file produced in a scratch directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SegmentFile {
    pub ordinal: u32,
    pub filename: String,
    pub path: PathBuf,
    pub duration: f64,
    pub byte_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SegmentMode {
    /// Split without re-encoding; sizes track duration × source bitrate.
    Copy,
    /// Re-encode at the given video bitrate (bits per second).
    Encode { bitrate_bps: u64 },
}

/// Hardware encoder family chosen at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoder {
    Software,
    Nvenc,
    Vaapi,
    VideoToolbox,
}

impl Encoder {
    pub fn video_codec_arg(&self) -> &'static str {
        match self {
            Encoder::Software => "libx264",
            Encoder::Nvenc => "h264_nvenc",
            Encoder::Vaapi => "h264_vaapi",
            Encoder::VideoToolbox => "h264_videotoolbox",
        }
    }

    pub fn hwaccel_args(&self) -> &'static [&'static str] {
        match self {
            Encoder::Software => &[],
            Encoder::Nvenc => &["-hwaccel", "cuda"],
            Encoder::Vaapi => &["-hwaccel", "vaapi", "-hwaccel_device", "/dev/dri/renderD128"],
            Encoder::VideoToolbox => &["-hwaccel", "videotoolbox"],
        }
    }
}

/// Capability seam over the external video tool. The planner and the ingest
/// coordinator only see this trait; tests substitute a scripted fake.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn probe(&self, path: &Path) -> TranscodeResult<MediaInfo>;

    /// Segment `input` into numbered `.ts` files plus a local playlist under
    /// `out_dir`, targeting `duration` seconds per segment.
    async fn segment(
        &self,
        input: &Path,
        out_dir: &Path,
        duration: f64,
        mode: SegmentMode,
    ) -> TranscodeResult<Vec<SegmentFile>>;

    /// Re-encode a single segment at `bitrate_bps`, replacing nothing;
    /// returns the output size in bytes.
    async fn reencode(
        &self,
        input: &Path,
        output: &Path,
        bitrate_bps: u64,
    ) -> TranscodeResult<u64>;

    /// Extract subtitle stream `0:s:<type_index>` as WebVTT.
    async fn extract_subtitle(
        &self,
        input: &Path,
        type_index: usize,
        output: &Path,
    ) -> TranscodeResult<()>;
}
