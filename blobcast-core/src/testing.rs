//! In-process fakes for the media engine and the remote store, used by unit
//! and integration tests. No ffmpeg and no network: the engine fabricates
//! segments whose sizes follow duration × bitrate, the remote keeps bytes in
//! memory and records per-account traffic.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;

use crate::config::AccountConfig;
use crate::media::{
    MediaEngine, MediaInfo, SegmentFile, SegmentMode, TrackInfo, TrackKind, TranscodeError,
    TranscodeResult,
};
use crate::remote::{
    RemoteDownload, RemoteError, RemoteFileInfo, RemoteHandle, RemoteResult, RemoteStore,
};

/// Scripted [`MediaEngine`]: segment sizes are `duration × bitrate / 8` with
/// a small deterministic per-ordinal skew. Files are written with short
/// deterministic contents; the modeled size is carried in the metadata.
pub struct FakeEngine {
    bitrate: u64,
    duration: f64,
    video_codec: String,
    subtitles: Vec<(String, String)>,
    oversize_ordinals: HashSet<u32>,
    probe_delay: Mutex<Option<std::time::Duration>>,
    copy_calls: AtomicUsize,
    encode_calls: AtomicUsize,
    reencode_calls: AtomicUsize,
    durations: Mutex<HashMap<PathBuf, f64>>,
}

impl FakeEngine {
    pub fn new(bitrate: u64, duration: f64) -> Self {
        Self {
            bitrate,
            duration,
            video_codec: "h264".to_string(),
            subtitles: Vec::new(),
            oversize_ordinals: HashSet::new(),
            probe_delay: Mutex::new(None),
            copy_calls: AtomicUsize::new(0),
            encode_calls: AtomicUsize::new(0),
            reencode_calls: AtomicUsize::new(0),
            durations: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_video_codec(mut self, codec: impl Into<String>) -> Self {
        self.video_codec = codec.into();
        self
    }

    /// Skew one copy-mode segment far above its modeled size, forcing the
    /// planner's repair path.
    pub fn with_oversize_ordinal(mut self, ordinal: u32) -> Self {
        self.oversize_ordinals.insert(ordinal);
        self
    }

    pub fn with_subtitle(mut self, language: impl Into<String>, title: impl Into<String>) -> Self {
        self.subtitles.push((language.into(), title.into()));
        self
    }

    /// Make the next probes sleep first; lets tests hold an ingest inside
    /// its probing phase.
    pub fn set_probe_delay(&self, delay: Option<std::time::Duration>) {
        *self.probe_delay.lock().expect("probe delay lock") = delay;
    }

    /// Write a placeholder source file and return its path.
    pub fn write_source(&self, dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"fake source container").expect("write fake source");
        path
    }

    pub fn copy_segment_calls(&self) -> usize {
        self.copy_calls.load(Ordering::SeqCst)
    }

    pub fn encode_segment_calls(&self) -> usize {
        self.encode_calls.load(Ordering::SeqCst)
    }

    pub fn reencode_calls(&self) -> usize {
        self.reencode_calls.load(Ordering::SeqCst)
    }

    fn input_duration(&self, input: &Path) -> f64 {
        self.durations
            .lock()
            .expect("duration map lock")
            .get(input)
            .copied()
            .unwrap_or(self.duration)
    }

    fn record_duration(&self, path: &Path, duration: f64) {
        self.durations
            .lock()
            .expect("duration map lock")
            .insert(path.to_path_buf(), duration);
    }

    fn write_segment(&self, path: &Path, ordinal: u32) -> TranscodeResult<()> {
        let contents = format!(
            "ts-payload ordinal={ordinal} file={}",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("?")
        );
        std::fs::write(path, contents).map_err(|source| TranscodeError::Io {
            source,
            path: path.to_path_buf(),
        })
    }
}

#[async_trait]
impl MediaEngine for FakeEngine {
    async fn probe(&self, path: &Path) -> TranscodeResult<MediaInfo> {
        let delay = *self.probe_delay.lock().expect("probe delay lock");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if !path.exists() {
            return Err(TranscodeError::Probe(format!(
                "no such file: {}",
                path.display()
            )));
        }
        let mut tracks = vec![
            TrackInfo {
                index: 0,
                type_index: 0,
                kind: TrackKind::Video,
                codec: self.video_codec.clone(),
                language: None,
                title: None,
                width: Some(1920),
                height: Some(1080),
                bitrate: Some(self.bitrate),
                is_default: true,
                is_forced: false,
                is_hearing_impaired: false,
            },
            TrackInfo {
                index: 1,
                type_index: 0,
                kind: TrackKind::Audio,
                codec: "aac".to_string(),
                language: Some("eng".to_string()),
                title: None,
                width: None,
                height: None,
                bitrate: Some(128_000),
                is_default: true,
                is_forced: false,
                is_hearing_impaired: false,
            },
        ];
        for (position, (language, title)) in self.subtitles.iter().enumerate() {
            tracks.push(TrackInfo {
                index: 2 + position as i64,
                type_index: position,
                kind: TrackKind::Subtitle,
                codec: "subrip".to_string(),
                language: Some(language.clone()),
                title: Some(title.clone()),
                width: None,
                height: None,
                bitrate: None,
                is_default: position == 0,
                is_forced: false,
                is_hearing_impaired: false,
            });
        }
        Ok(MediaInfo {
            container: "mov,mp4,m4a".to_string(),
            duration: self.duration,
            byte_size: (self.bitrate as f64 / 8.0 * self.duration) as u64,
            bitrate: self.bitrate,
            tracks,
        })
    }

    async fn segment(
        &self,
        input: &Path,
        out_dir: &Path,
        duration: f64,
        mode: SegmentMode,
    ) -> TranscodeResult<Vec<SegmentFile>> {
        match mode {
            SegmentMode::Copy => self.copy_calls.fetch_add(1, Ordering::SeqCst),
            SegmentMode::Encode { .. } => self.encode_calls.fetch_add(1, Ordering::SeqCst),
        };
        std::fs::create_dir_all(out_dir).map_err(|source| TranscodeError::Io {
            source,
            path: out_dir.to_path_buf(),
        })?;
        let total = self.input_duration(input);
        let count = (total / duration).ceil().max(1.0) as u32;
        let mut segments = Vec::with_capacity(count as usize);
        for ordinal in 0..count {
            let seg_duration = if ordinal == count - 1 {
                total - duration * (count - 1) as f64
            } else {
                duration
            };
            let rate = match mode {
                SegmentMode::Copy => self.bitrate,
                SegmentMode::Encode { bitrate_bps } => bitrate_bps + 128_000,
            };
            // small deterministic skew mimicking keyframe drift
            let mut byte_size =
                (rate as f64 / 8.0 * seg_duration * (1.0 + 0.02 * (ordinal % 3) as f64)) as u64;
            if matches!(mode, SegmentMode::Copy) && self.oversize_ordinals.contains(&ordinal) {
                byte_size = byte_size.saturating_mul(3);
            }
            let filename = format!("segment_{ordinal:05}.ts");
            let path = out_dir.join(&filename);
            self.write_segment(&path, ordinal)?;
            self.record_duration(&path, seg_duration);
            segments.push(SegmentFile {
                ordinal,
                filename,
                path,
                duration: seg_duration,
                byte_size,
            });
        }
        Ok(segments)
    }

    async fn reencode(
        &self,
        input: &Path,
        output: &Path,
        bitrate_bps: u64,
    ) -> TranscodeResult<u64> {
        self.reencode_calls.fetch_add(1, Ordering::SeqCst);
        let duration = self.input_duration(input);
        let byte_size = ((bitrate_bps + 128_000) as f64 / 8.0 * duration) as u64;
        std::fs::copy(input, output).map_err(|source| TranscodeError::Io {
            source,
            path: output.to_path_buf(),
        })?;
        self.record_duration(output, duration);
        Ok(byte_size)
    }

    async fn extract_subtitle(
        &self,
        _input: &Path,
        type_index: usize,
        output: &Path,
    ) -> TranscodeResult<()> {
        let body = format!("WEBVTT\n\n00:00.000 --> 00:02.000\nfake track {type_index}\n");
        std::fs::write(output, body).map_err(|source| TranscodeError::Io {
            source,
            path: output.to_path_buf(),
        })
    }
}

/// In-memory [`RemoteStore`] keyed by account `chat_id`, with fault
/// injection for transient upload failures and whole-account outages.
#[derive(Default)]
pub struct FakeRemote {
    files: Mutex<HashMap<String, Bytes>>,
    uploads_per_account: Mutex<HashMap<String, usize>>,
    download_log: Mutex<Vec<(String, String)>>,
    deleted: Mutex<Vec<String>>,
    offline: Mutex<HashSet<String>>,
    fail_next_uploads: AtomicUsize,
    downloads_started: AtomicUsize,
    next_message_id: AtomicI64,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self {
            next_message_id: AtomicI64::new(100),
            ..Self::default()
        }
    }

    /// The next `n` uploads fail with a transient network error.
    pub fn fail_next_uploads(&self, n: usize) {
        self.fail_next_uploads.store(n, Ordering::SeqCst);
    }

    pub fn set_offline(&self, chat_id: &str, offline: bool) {
        let mut set = self.offline.lock().expect("offline lock");
        if offline {
            set.insert(chat_id.to_string());
        } else {
            set.remove(chat_id);
        }
    }

    pub fn upload_count(&self, chat_id: &str) -> usize {
        self.uploads_per_account
            .lock()
            .expect("uploads lock")
            .get(chat_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn downloads_started(&self) -> usize {
        self.downloads_started.load(Ordering::SeqCst)
    }

    /// `(chat_id, file_id)` pairs in download order.
    pub fn download_log(&self) -> Vec<(String, String)> {
        self.download_log.lock().expect("download log lock").clone()
    }

    pub fn deleted_handles(&self) -> Vec<String> {
        self.deleted.lock().expect("deleted lock").clone()
    }

    pub fn stored_bytes(&self, file_id: &str) -> Option<Bytes> {
        self.files.lock().expect("files lock").get(file_id).cloned()
    }

    pub fn stored_count(&self) -> usize {
        self.files.lock().expect("files lock").len()
    }

    fn check_online(&self, account: &AccountConfig) -> RemoteResult<()> {
        if self
            .offline
            .lock()
            .expect("offline lock")
            .contains(&account.chat_id)
        {
            return Err(RemoteError::Network(format!(
                "account {} unreachable",
                account.chat_id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for FakeRemote {
    async fn upload(
        &self,
        account: &AccountConfig,
        bytes: Bytes,
        filename: &str,
    ) -> RemoteResult<RemoteHandle> {
        self.check_online(account)?;
        let injected = self
            .fail_next_uploads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |value| {
                value.checked_sub(1)
            })
            .is_ok();
        if injected {
            return Err(RemoteError::Network("injected upload failure".to_string()));
        }
        let message_id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        let file_id = format!("file-{}-{}-{}", account.chat_id, message_id, filename);
        self.files
            .lock()
            .expect("files lock")
            .insert(file_id.clone(), bytes);
        *self
            .uploads_per_account
            .lock()
            .expect("uploads lock")
            .entry(account.chat_id.clone())
            .or_insert(0) += 1;
        Ok(RemoteHandle {
            message_id,
            file_id,
        })
    }

    async fn info(
        &self,
        account: &AccountConfig,
        handle: &RemoteHandle,
    ) -> RemoteResult<RemoteFileInfo> {
        self.check_online(account)?;
        let files = self.files.lock().expect("files lock");
        let bytes = files.get(&handle.file_id).ok_or_else(|| RemoteError::Api {
            status: 400,
            message: "unknown file id".to_string(),
        })?;
        Ok(RemoteFileInfo {
            remote_path: format!("documents/{}", handle.file_id),
            size: Some(bytes.len() as u64),
        })
    }

    async fn download(
        &self,
        account: &AccountConfig,
        handle: &RemoteHandle,
    ) -> RemoteResult<RemoteDownload> {
        self.check_online(account)?;
        self.downloads_started.fetch_add(1, Ordering::SeqCst);
        self.download_log
            .lock()
            .expect("download log lock")
            .push((account.chat_id.clone(), handle.file_id.clone()));
        let bytes = self
            .stored_bytes(&handle.file_id)
            .ok_or_else(|| RemoteError::Api {
                status: 400,
                message: "unknown file id".to_string(),
            })?;
        let size = bytes.len() as u64;
        // chunked to exercise streaming consumers
        let chunks: Vec<RemoteResult<Bytes>> = bytes
            .chunks(4096)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        Ok(RemoteDownload {
            size: Some(size),
            stream: Box::pin(stream::iter(chunks)),
        })
    }

    async fn delete(&self, account: &AccountConfig, handle: &RemoteHandle) -> RemoteResult<()> {
        self.check_online(account)?;
        self.files
            .lock()
            .expect("files lock")
            .remove(&handle.file_id);
        self.deleted
            .lock()
            .expect("deleted lock")
            .push(handle.to_string());
        Ok(())
    }

    async fn ping(&self, account: &AccountConfig) -> RemoteResult<()> {
        self.check_online(account)
    }
}

/// Account fixtures used across the test suites.
pub fn test_accounts(count: usize) -> Vec<AccountConfig> {
    (0..count)
        .map(|index| AccountConfig {
            id: Some(format!("acct{}", index + 1)),
            token: format!("00000000{}:TESTTOKEN", index + 1),
            chat_id: format!("@store_{}", index + 1),
        })
        .collect()
}
