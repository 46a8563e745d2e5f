mod disk;
mod memory;
mod prefetch;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::remote::{RemoteDownload, RemoteError};

pub use disk::DiskCache;
pub use memory::MemoryCache;
pub use prefetch::{Prefetcher, SegmentFetcher};

pub const SEGMENT_CONTENT_TYPE: &str = "video/MP2T";

/// Cache key: one media object of one video.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SegmentKey {
    pub video_id: String,
    pub name: String,
}

impl SegmentKey {
    pub fn new(video_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            video_id: video_id.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for SegmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.video_id, self.name)
    }
}

/// Fully materialized cache value.
#[derive(Debug, Clone)]
pub struct CachedSegment {
    pub bytes: Bytes,
    pub content_type: String,
}

/// Playback-path error; `Clone` so single-flight followers can share it.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("segment fetch timed out")]
    Timeout,
    #[error("segment fetch failed: {0}")]
    Failed(String),
    #[error("account {0} is not available")]
    AccountUnavailable(String),
    #[error("fetch interrupted before completion")]
    Interrupted,
}

impl From<RemoteError> for FetchError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Timeout { .. } => FetchError::Timeout,
            other => FetchError::Failed(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheUsage {
    pub bytes: u64,
    pub entries: usize,
}

/// Storage behind the cache; `memory` and `disk` are interchangeable.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &SegmentKey) -> Option<CachedSegment>;
    /// Insert and return the keys evicted to make room.
    async fn insert(&self, key: SegmentKey, value: CachedSegment) -> Vec<SegmentKey>;
    async fn contains(&self, key: &SegmentKey) -> bool;
    async fn clear(&self);
    async fn usage(&self) -> CacheUsage;
}

#[derive(Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    bytes_served: AtomicU64,
    prefetch_success: AtomicU64,
    prefetch_failure: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub bytes_served: u64,
    pub prefetch_success: u64,
    pub prefetch_failure: u64,
    pub current_bytes: u64,
    pub entries: usize,
}

#[derive(Clone)]
enum InflightState {
    Streaming,
    Done,
    Failed(FetchError),
}

/// One in-flight download: a growing buffer plus a notification channel.
/// The leader's HTTP response and any followers all stream from the buffer,
/// so nobody waits for the full segment before first byte.
struct InflightSegment {
    content_type: String,
    size_hint: Mutex<Option<u64>>,
    buffer: Mutex<Vec<u8>>,
    state: watch::Sender<InflightState>,
}

impl InflightSegment {
    fn new(content_type: String) -> Arc<Self> {
        let (state, _) = watch::channel(InflightState::Streaming);
        Arc::new(Self {
            content_type,
            size_hint: Mutex::new(None),
            buffer: Mutex::new(Vec::new()),
            state,
        })
    }

    fn append(&self, chunk: &[u8]) {
        self.buffer.lock().expect("inflight buffer lock").extend_from_slice(chunk);
        let _ = self.state.send_replace(InflightState::Streaming);
    }

    fn finish(&self, state: InflightState) {
        let _ = self.state.send_replace(state);
    }

    fn byte_stream(self: &Arc<Self>) -> BoxStream<'static, Result<Bytes, FetchError>> {
        let inflight = Arc::clone(self);
        let receiver = self.state.subscribe();
        stream::unfold(
            (inflight, receiver, 0usize),
            |(inflight, mut receiver, offset)| async move {
                if offset == usize::MAX {
                    return None;
                }
                loop {
                    let (chunk, state) = {
                        let buffer = inflight.buffer.lock().expect("inflight buffer lock");
                        let state = receiver.borrow().clone();
                        if offset < buffer.len() {
                            (Some(Bytes::copy_from_slice(&buffer[offset..])), state)
                        } else {
                            (None, state)
                        }
                    };
                    if let Some(chunk) = chunk {
                        let next = offset + chunk.len();
                        return Some((Ok(chunk), (inflight, receiver, next)));
                    }
                    match state {
                        InflightState::Done => return None,
                        InflightState::Failed(err) => {
                            return Some((Err(err), (inflight, receiver, usize::MAX)));
                        }
                        InflightState::Streaming => {
                            if receiver.changed().await.is_err() {
                                return Some((
                                    Err(FetchError::Interrupted),
                                    (inflight, receiver, usize::MAX),
                                ));
                            }
                        }
                    }
                }
            },
        )
        .boxed()
    }
}

/// What a cache request hands back to the HTTP layer.
pub enum SegmentPayload {
    /// The full bytes are in the cache; ranges can be served from here.
    Cached(CachedSegment),
    /// A download is in flight; bytes stream as they arrive.
    Streaming {
        content_type: String,
        size: Option<u64>,
        stream: BoxStream<'static, Result<Bytes, FetchError>>,
    },
}

struct CacheInner {
    backend: Box<dyn CacheBackend>,
    stats: CacheStats,
    inflight: Mutex<HashMap<SegmentKey, Arc<InflightSegment>>>,
}

/// Byte-bounded segment cache with single-flight remote fetches. Cheap to
/// clone; all clones share one store and one in-flight table.
#[derive(Clone)]
pub struct SegmentCache {
    inner: Arc<CacheInner>,
}

impl SegmentCache {
    pub fn new(backend: Box<dyn CacheBackend>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                backend,
                stats: CacheStats::default(),
                inflight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub async fn get_cached(&self, key: &SegmentKey) -> Option<CachedSegment> {
        match self.inner.backend.get(key).await {
            Some(value) => {
                self.inner.stats.hits.fetch_add(1, Ordering::Relaxed);
                self.inner
                    .stats
                    .bytes_served
                    .fetch_add(value.bytes.len() as u64, Ordering::Relaxed);
                Some(value)
            }
            None => None,
        }
    }

    /// Whether a prefetch for `key` would be a no-op.
    pub async fn present_or_inflight(&self, key: &SegmentKey) -> bool {
        if self
            .inner
            .inflight
            .lock()
            .expect("inflight table lock")
            .contains_key(key)
        {
            return true;
        }
        self.inner.backend.contains(key).await
    }

    /// Serve `key` from the cache, attaching to an in-flight download or
    /// starting one via `fetch`. At most one download per key exists; its
    /// progressive buffer is shared by all callers and becomes the cache
    /// entry on success.
    pub async fn fetch<F, Fut>(
        &self,
        key: SegmentKey,
        content_type: &str,
        fetch: F,
    ) -> Result<SegmentPayload, FetchError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<RemoteDownload, FetchError>> + Send + 'static,
    {
        if let Some(value) = self.get_cached(&key).await {
            return Ok(SegmentPayload::Cached(value));
        }
        self.inner.stats.misses.fetch_add(1, Ordering::Relaxed);

        let (inflight, leader) = {
            let mut table = self.inner.inflight.lock().expect("inflight table lock");
            match table.get(&key) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    let created = InflightSegment::new(content_type.to_string());
                    table.insert(key.clone(), Arc::clone(&created));
                    (created, true)
                }
            }
        };

        if leader {
            let cache = self.clone();
            let driver_key = key.clone();
            let driver = Arc::clone(&inflight);
            tokio::spawn(async move {
                cache.drive_download(driver_key, driver, fetch).await;
            });
        } else {
            debug!(target: "cache", key = %key, "attached to in-flight download");
        }

        let size = *inflight.size_hint.lock().expect("size hint lock");
        Ok(SegmentPayload::Streaming {
            content_type: inflight.content_type.clone(),
            size,
            stream: inflight.byte_stream(),
        })
    }

    /// Like [`fetch`], but waits for completion and returns the full bytes.
    /// Used by the prefetcher and by range requests that need the whole
    /// segment.
    pub async fn fetch_full<F, Fut>(
        &self,
        key: SegmentKey,
        content_type: &str,
        fetch: F,
    ) -> Result<CachedSegment, FetchError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<RemoteDownload, FetchError>> + Send + 'static,
    {
        match self.fetch(key, content_type, fetch).await? {
            SegmentPayload::Cached(value) => Ok(value),
            SegmentPayload::Streaming {
                content_type,
                mut stream,
                ..
            } => {
                let mut collected = Vec::new();
                while let Some(chunk) = stream.next().await {
                    collected.extend_from_slice(&chunk?);
                }
                Ok(CachedSegment {
                    bytes: Bytes::from(collected),
                    content_type,
                })
            }
        }
    }

    /// Pull the remote download into the in-flight buffer, then promote the
    /// buffer to a cache entry. The in-flight table entry is cleared on both
    /// success and failure; failures are never cached.
    async fn drive_download<F, Fut>(&self, key: SegmentKey, inflight: Arc<InflightSegment>, fetch: F)
    where
        F: FnOnce() -> Fut + Send,
        Fut: std::future::Future<Output = Result<RemoteDownload, FetchError>> + Send,
    {
        let result = async {
            let download = fetch().await?;
            *inflight.size_hint.lock().expect("size hint lock") = download.size;
            let mut stream = download.stream;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(FetchError::from)?;
                inflight.append(&chunk);
            }
            Ok::<(), FetchError>(())
        }
        .await;

        self.inner
            .inflight
            .lock()
            .expect("inflight table lock")
            .remove(&key);

        match result {
            Ok(()) => {
                let bytes = {
                    let buffer = inflight.buffer.lock().expect("inflight buffer lock");
                    Bytes::copy_from_slice(&buffer)
                };
                let len = bytes.len() as u64;
                let evicted = self
                    .inner
                    .backend
                    .insert(
                        key.clone(),
                        CachedSegment {
                            bytes,
                            content_type: inflight.content_type.clone(),
                        },
                    )
                    .await;
                self.inner
                    .stats
                    .evictions
                    .fetch_add(evicted.len() as u64, Ordering::Relaxed);
                self.inner
                    .stats
                    .bytes_served
                    .fetch_add(len, Ordering::Relaxed);
                inflight.finish(InflightState::Done);
            }
            Err(err) => {
                warn!(target: "cache", key = %key, "download failed: {err}");
                inflight.finish(InflightState::Failed(err));
            }
        }
    }

    pub async fn clear(&self) {
        self.inner.backend.clear().await;
    }

    pub fn record_prefetch(&self, success: bool) {
        let counter = if success {
            &self.inner.stats.prefetch_success
        } else {
            &self.inner.stats.prefetch_failure
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn stats(&self) -> CacheStatsSnapshot {
        let usage = self.inner.backend.usage().await;
        let stats = &self.inner.stats;
        CacheStatsSnapshot {
            hits: stats.hits.load(Ordering::Relaxed),
            misses: stats.misses.load(Ordering::Relaxed),
            evictions: stats.evictions.load(Ordering::Relaxed),
            bytes_served: stats.bytes_served.load(Ordering::Relaxed),
            prefetch_success: stats.prefetch_success.load(Ordering::Relaxed),
            prefetch_failure: stats.prefetch_failure.load(Ordering::Relaxed),
            current_bytes: usage.bytes,
            entries: usage.entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn memory_cache(limit: u64) -> SegmentCache {
        SegmentCache::new(Box::new(MemoryCache::new(limit, Some(Duration::from_secs(300)))))
    }

    fn download_of(bytes: &'static [u8]) -> RemoteDownload {
        let chunks: Vec<Result<Bytes, RemoteError>> = bytes
            .chunks(3)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        RemoteDownload {
            size: Some(bytes.len() as u64),
            stream: Box::pin(stream::iter(chunks)),
        }
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let cache = memory_cache(1024 * 1024);
        let key = SegmentKey::new("vid", "segment_00000.ts");

        let value = cache
            .fetch_full(key.clone(), SEGMENT_CONTENT_TYPE, || async {
                Ok(download_of(b"0123456789"))
            })
            .await
            .unwrap();
        assert_eq!(&value.bytes[..], b"0123456789");

        let hit = cache.get_cached(&key).await.unwrap();
        assert_eq!(&hit.bytes[..], b"0123456789");
        let stats = cache.stats().await;
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn concurrent_fetches_share_one_download() {
        let cache = memory_cache(1024 * 1024);
        let key = SegmentKey::new("vid", "segment_00001.ts");
        let downloads = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let key = key.clone();
            let downloads = Arc::clone(&downloads);
            tasks.push(tokio::spawn(async move {
                cache
                    .fetch_full(key, SEGMENT_CONTENT_TYPE, move || async move {
                        downloads.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok(download_of(b"shared-bytes"))
                    })
                    .await
            }));
        }
        for task in tasks {
            let value = task.await.unwrap().unwrap();
            assert_eq!(&value.bytes[..], b"shared-bytes");
        }
        assert_eq!(downloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_are_not_cached_and_clear_the_table() {
        let cache = memory_cache(1024 * 1024);
        let key = SegmentKey::new("vid", "segment_00002.ts");

        let err = cache
            .fetch_full(key.clone(), SEGMENT_CONTENT_TYPE, || async {
                Err::<RemoteDownload, _>(FetchError::Failed("boom".to_string()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Failed(_)));
        assert!(!cache.present_or_inflight(&key).await);

        // the key is retryable after the failure
        let value = cache
            .fetch_full(key, SEGMENT_CONTENT_TYPE, || async {
                Ok(download_of(b"recovered"))
            })
            .await
            .unwrap();
        assert_eq!(&value.bytes[..], b"recovered");
    }

    #[tokio::test]
    async fn streaming_payload_yields_bytes_before_completion() {
        let cache = memory_cache(1024 * 1024);
        let key = SegmentKey::new("vid", "segment_00003.ts");

        let payload = cache
            .fetch(key, SEGMENT_CONTENT_TYPE, || async {
                let chunks: Vec<Result<Bytes, RemoteError>> = vec![
                    Ok(Bytes::from_static(b"first-")),
                    Ok(Bytes::from_static(b"second")),
                ];
                Ok(RemoteDownload {
                    size: Some(12),
                    stream: Box::pin(stream::iter(chunks)),
                })
            })
            .await
            .unwrap();
        let SegmentPayload::Streaming { mut stream, .. } = payload else {
            panic!("cold key must stream");
        };
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, b"first-second");
    }
}
