use std::path::Path;
use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::MediaSection;

use super::error::{TranscodeError, TranscodeResult};
use super::types::{
    Encoder, MediaEngine, MediaInfo, SegmentFile, SegmentMode, TrackInfo, TrackKind,
};

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);
const SEGMENT_TIMEOUT: Duration = Duration::from_secs(3600);
const REENCODE_TIMEOUT: Duration = Duration::from_secs(1800);
const STDERR_TAIL: usize = 2000;

/// Real engine wrapping ffmpeg/ffprobe subprocesses.
#[derive(Debug, Clone)]
pub struct FfmpegEngine {
    ffmpeg: String,
    ffprobe: String,
    encoder: Encoder,
}

impl FfmpegEngine {
    pub fn from_config(media: &MediaSection) -> Self {
        let encoder = match media.hardware_accel.as_str() {
            "none" => Encoder::Software,
            "nvenc" => Encoder::Nvenc,
            "vaapi" | "qsv" => Encoder::Vaapi,
            "videotoolbox" => Encoder::VideoToolbox,
            _ => detect_encoder(),
        };
        info!(target: "media", encoder = encoder.video_codec_arg(), "media engine configured");
        Self {
            ffmpeg: media.ffmpeg_path.clone(),
            ffprobe: media.ffprobe_path.clone(),
            encoder,
        }
    }

    pub fn encoder(&self) -> Encoder {
        self.encoder
    }

    /// Startup check that the ffmpeg binary exists and runs.
    pub async fn verify(&self) -> TranscodeResult<()> {
        let output = run(
            Command::new(&self.ffmpeg).arg("-version"),
            &self.ffmpeg,
            PROBE_TIMEOUT,
        )
        .await?;
        check_status(&self.ffmpeg, &output)?;
        Ok(())
    }

    fn encode_args(&self, command: &mut Command, bitrate_bps: u64) {
        command
            .arg("-c:v")
            .arg(self.encoder.video_codec_arg())
            .arg("-b:v")
            .arg(bitrate_bps.to_string())
            .arg("-maxrate")
            .arg(bitrate_bps.to_string())
            .arg("-bufsize")
            .arg((bitrate_bps * 3 / 2).to_string())
            .arg("-preset")
            .arg("fast")
            .arg("-c:a")
            .arg("aac")
            .arg("-b:a")
            .arg("128k");
    }
}

#[async_trait]
impl MediaEngine for FfmpegEngine {
    async fn probe(&self, path: &Path) -> TranscodeResult<MediaInfo> {
        let mut command = Command::new(&self.ffprobe);
        command
            .arg("-v")
            .arg("quiet")
            .arg("-print_format")
            .arg("json")
            .arg("-show_format")
            .arg("-show_streams")
            .arg(path);
        let output = run(&mut command, &self.ffprobe, PROBE_TIMEOUT).await?;
        check_status(&self.ffprobe, &output)?;
        parse_probe_output(&output.stdout)
    }

    async fn segment(
        &self,
        input: &Path,
        out_dir: &Path,
        duration: f64,
        mode: SegmentMode,
    ) -> TranscodeResult<Vec<SegmentFile>> {
        tokio::fs::create_dir_all(out_dir)
            .await
            .map_err(|source| TranscodeError::Io {
                source,
                path: out_dir.to_path_buf(),
            })?;
        let mut command = Command::new(&self.ffmpeg);
        command.arg("-y");
        if let SegmentMode::Encode { .. } = mode {
            for arg in self.encoder.hwaccel_args() {
                command.arg(arg);
            }
        }
        command.arg("-i").arg(input);
        match mode {
            SegmentMode::Copy => {
                command.arg("-c:v").arg("copy").arg("-c:a").arg("copy");
            }
            SegmentMode::Encode { bitrate_bps } => {
                self.encode_args(&mut command, bitrate_bps);
            }
        }
        command
            .arg("-f")
            .arg("hls")
            .arg("-hls_time")
            .arg(format!("{duration}"))
            .arg("-hls_list_size")
            .arg("0")
            .arg("-hls_playlist_type")
            .arg("vod")
            .arg("-hls_flags")
            .arg("independent_segments")
            .arg("-hls_segment_filename")
            .arg(out_dir.join("segment_%05d.ts"))
            .arg(out_dir.join("playlist.m3u8"));

        debug!(target: "media", input = %input.display(), duration, "segmenting");
        let output = run(&mut command, &self.ffmpeg, SEGMENT_TIMEOUT).await?;
        check_status(&self.ffmpeg, &output)?;
        collect_segments(out_dir).await
    }

    async fn reencode(
        &self,
        input: &Path,
        output: &Path,
        bitrate_bps: u64,
    ) -> TranscodeResult<u64> {
        let mut command = Command::new(&self.ffmpeg);
        command.arg("-y");
        for arg in self.encoder.hwaccel_args() {
            command.arg(arg);
        }
        command
            .arg("-i")
            .arg(input)
            .arg("-avoid_negative_ts")
            .arg("make_zero");
        self.encode_args(&mut command, bitrate_bps);
        command.arg("-f").arg("mpegts").arg(output);

        debug!(target: "media", input = %input.display(), bitrate_bps, "re-encoding segment");
        let result = run(&mut command, &self.ffmpeg, REENCODE_TIMEOUT).await?;
        check_status(&self.ffmpeg, &result)?;
        let metadata = tokio::fs::metadata(output)
            .await
            .map_err(|source| TranscodeError::Io {
                source,
                path: output.to_path_buf(),
            })?;
        Ok(metadata.len())
    }

    async fn extract_subtitle(
        &self,
        input: &Path,
        type_index: usize,
        output: &Path,
    ) -> TranscodeResult<()> {
        let mut command = Command::new(&self.ffmpeg);
        command
            .arg("-y")
            .arg("-i")
            .arg(input)
            .arg("-map")
            .arg(format!("0:s:{type_index}"))
            .arg("-c:s")
            .arg("webvtt")
            .arg(output);
        let result = run(&mut command, &self.ffmpeg, REENCODE_TIMEOUT).await?;
        check_status(&self.ffmpeg, &result)?;
        Ok(())
    }
}

/// Pick an encoder for `hardware_accel = "auto"` by probing the host.
fn detect_encoder() -> Encoder {
    let nvidia = std::process::Command::new("nvidia-smi")
        .arg("--list-gpus")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false);
    if nvidia {
        return Encoder::Nvenc;
    }
    if Path::new("/dev/dri/renderD128").exists() {
        return Encoder::Vaapi;
    }
    Encoder::Software
}

async fn run(command: &mut Command, program: &str, timeout: Duration) -> TranscodeResult<Output> {
    let future = command.output();
    match tokio::time::timeout(timeout, future).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(source)) => Err(TranscodeError::Spawn {
            program: program.to_string(),
            source,
        }),
        Err(_) => Err(TranscodeError::Timeout {
            program: program.to_string(),
            seconds: timeout.as_secs(),
        }),
    }
}

fn check_status(program: &str, output: &Output) -> TranscodeResult<()> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let tail = if stderr.len() > STDERR_TAIL {
        &stderr[stderr.len() - STDERR_TAIL..]
    } else {
        &stderr
    };
    Err(TranscodeError::CommandFailed {
        program: program.to_string(),
        status: output.status.code(),
        stderr: tail.trim().to_string(),
    })
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    format: ProbeFormat,
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    format_name: Option<String>,
    duration: Option<String>,
    size: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ProbeStream {
    #[serde(default)]
    index: i64,
    codec_name: Option<String>,
    codec_type: Option<String>,
    width: Option<i64>,
    height: Option<i64>,
    bit_rate: Option<String>,
    #[serde(default)]
    tags: ProbeTags,
    #[serde(default)]
    disposition: ProbeDisposition,
}

#[derive(Debug, Default, Deserialize)]
struct ProbeTags {
    language: Option<String>,
    title: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ProbeDisposition {
    #[serde(default)]
    default: i64,
    #[serde(default)]
    forced: i64,
    #[serde(default)]
    hearing_impaired: i64,
}

fn parse_probe_output(stdout: &[u8]) -> TranscodeResult<MediaInfo> {
    let parsed: ProbeOutput = serde_json::from_slice(stdout)
        .map_err(|err| TranscodeError::Probe(err.to_string()))?;

    let mut counters = [0usize; 3];
    let mut tracks = Vec::new();
    for stream in parsed.streams {
        let kind = match stream.codec_type.as_deref() {
            Some("video") => TrackKind::Video,
            Some("audio") => TrackKind::Audio,
            Some("subtitle") => TrackKind::Subtitle,
            _ => continue,
        };
        let slot = kind as usize;
        tracks.push(TrackInfo {
            index: stream.index,
            type_index: counters[slot],
            kind,
            codec: stream.codec_name.unwrap_or_else(|| "unknown".to_string()),
            language: stream.tags.language,
            title: stream.tags.title,
            width: stream.width,
            height: stream.height,
            bitrate: stream.bit_rate.and_then(|value| value.parse().ok()),
            is_default: stream.disposition.default != 0,
            is_forced: stream.disposition.forced != 0,
            is_hearing_impaired: stream.disposition.hearing_impaired != 0,
        });
        counters[slot] += 1;
    }

    Ok(MediaInfo {
        container: parsed
            .format
            .format_name
            .unwrap_or_else(|| "unknown".to_string()),
        duration: parsed
            .format
            .duration
            .and_then(|value| value.parse().ok())
            .unwrap_or(0.0),
        byte_size: parsed
            .format
            .size
            .and_then(|value| value.parse().ok())
            .unwrap_or(0),
        bitrate: parsed
            .format
            .bit_rate
            .and_then(|value| value.parse().ok())
            .unwrap_or(0),
        tracks,
    })
}

/// Read the local playlist a segmentation run left behind and pair every
/// entry with its on-disk size.
async fn collect_segments(out_dir: &Path) -> TranscodeResult<Vec<SegmentFile>> {
    let playlist_path = out_dir.join("playlist.m3u8");
    let contents = tokio::fs::read_to_string(&playlist_path)
        .await
        .map_err(|source| TranscodeError::Io {
            source,
            path: playlist_path,
        })?;
    let entries = parse_local_playlist(&contents)?;

    let mut segments = Vec::with_capacity(entries.len());
    for (ordinal, (filename, duration)) in entries.into_iter().enumerate() {
        let path = out_dir.join(&filename);
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|source| TranscodeError::Io {
                source,
                path: path.clone(),
            })?;
        segments.push(SegmentFile {
            ordinal: ordinal as u32,
            filename,
            path,
            duration,
            byte_size: metadata.len(),
        });
    }
    if segments.is_empty() {
        return Err(TranscodeError::PlaylistParse(
            "segmentation produced no segments".to_string(),
        ));
    }
    Ok(segments)
}

/// Parse `(filename, duration)` pairs out of an on-disk media playlist.
pub(crate) fn parse_local_playlist(contents: &str) -> TranscodeResult<Vec<(String, f64)>> {
    let mut entries = Vec::new();
    let mut pending: Option<f64> = None;
    for line in contents.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("#EXTINF:") {
            let duration = rest
                .split(',')
                .next()
                .and_then(|value| value.trim().parse::<f64>().ok())
                .ok_or_else(|| {
                    TranscodeError::PlaylistParse(format!("bad EXTINF line: {line}"))
                })?;
            pending = Some(duration);
        } else if !line.is_empty() && !line.starts_with('#') {
            let duration = pending.take().ok_or_else(|| {
                TranscodeError::PlaylistParse(format!("segment without EXTINF: {line}"))
            })?;
            entries.push((line.to_string(), duration));
        }
    }
    Ok(entries)
}
