use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::catalog::{SegmentRecord, SqliteCatalogStore};
use crate::config::AccountConfig;
use crate::remote::{RemoteDownload, RemoteError, RemoteHandle, RemoteStore};

use super::{
    CachedSegment, FetchError, SegmentCache, SegmentKey, SegmentPayload, SEGMENT_CONTENT_TYPE,
};

/// Resolves segment rows to remote downloads through the cache, using
/// exactly the account recorded for each row. Shared by the HTTP handlers
/// and the prefetcher.
pub struct SegmentFetcher {
    catalog: SqliteCatalogStore,
    remote: Arc<dyn RemoteStore>,
    accounts: HashMap<String, AccountConfig>,
    cache: SegmentCache,
}

impl SegmentFetcher {
    pub fn new(
        catalog: SqliteCatalogStore,
        remote: Arc<dyn RemoteStore>,
        accounts: HashMap<String, AccountConfig>,
        cache: SegmentCache,
    ) -> Self {
        Self {
            catalog,
            remote,
            accounts,
            cache,
        }
    }

    pub fn cache(&self) -> &SegmentCache {
        &self.cache
    }

    pub fn account(&self, account_id: &str) -> Option<&AccountConfig> {
        self.accounts.get(account_id)
    }

    /// Build the single-flight fetch future for one stored blob. Fails up
    /// front when the recorded account is no longer configured; never falls
    /// back to another account.
    fn remote_fetch(
        &self,
        account_id: &str,
        handle: &str,
    ) -> Result<
        impl std::future::Future<Output = Result<RemoteDownload, FetchError>> + Send + 'static,
        FetchError,
    > {
        let account = self
            .accounts
            .get(account_id)
            .cloned()
            .ok_or_else(|| FetchError::AccountUnavailable(account_id.to_string()))?;
        let handle: RemoteHandle = handle
            .parse()
            .map_err(|err: RemoteError| FetchError::Failed(err.to_string()))?;
        let remote = Arc::clone(&self.remote);
        let account_id = account_id.to_string();
        Ok(async move {
            match remote.download(&account, &handle).await {
                Ok(download) => Ok(download),
                Err(err @ RemoteError::Network(_)) => {
                    // Distinguish a dead account from a flaky fetch; still
                    // strictly the recorded account.
                    if remote.ping(&account).await.is_err() {
                        Err(FetchError::AccountUnavailable(account_id))
                    } else {
                        Err(FetchError::from(err))
                    }
                }
                Err(err) => Err(FetchError::from(err)),
            }
        })
    }

    /// Streaming payload for the playback path.
    pub async fn segment_payload(
        &self,
        record: &SegmentRecord,
        content_type: &str,
    ) -> Result<SegmentPayload, FetchError> {
        let key = SegmentKey::new(&record.video_id, &record.filename);
        let fetch = self.remote_fetch(&record.account_id, &record.handle)?;
        self.cache.fetch(key, content_type, move || fetch).await
    }

    /// Full bytes; used by prefetch and by range requests.
    pub async fn segment_bytes(
        &self,
        record: &SegmentRecord,
        content_type: &str,
    ) -> Result<CachedSegment, FetchError> {
        let key = SegmentKey::new(&record.video_id, &record.filename);
        let fetch = self.remote_fetch(&record.account_id, &record.handle)?;
        self.cache.fetch_full(key, content_type, move || fetch).await
    }

    /// Full bytes for an arbitrary stored blob (subtitle files).
    pub async fn blob_bytes(
        &self,
        account_id: &str,
        handle: &str,
        key: SegmentKey,
        content_type: &str,
    ) -> Result<CachedSegment, FetchError> {
        let fetch = self.remote_fetch(account_id, handle)?;
        self.cache.fetch_full(key, content_type, move || fetch).await
    }

    /// Prefetch one ordinal. Returns `None` when there was nothing to do
    /// (no such row, or already cached/in flight).
    pub async fn prefetch_one(&self, video_id: &str, ordinal: i64) -> Option<bool> {
        let record = match self.catalog.segment(video_id, ordinal) {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(err) => {
                warn!(target: "prefetch", video_id, ordinal, "catalog lookup failed: {err}");
                return Some(false);
            }
        };
        let key = SegmentKey::new(&record.video_id, &record.filename);
        if self.cache.present_or_inflight(&key).await {
            return None;
        }
        match self.segment_bytes(&record, SEGMENT_CONTENT_TYPE).await {
            Ok(_) => Some(true),
            Err(err) => {
                debug!(target: "prefetch", video_id, ordinal, "prefetch failed: {err}");
                Some(false)
            }
        }
    }
}

/// Background prefetcher: on every miss the server reports the playhead and
/// the next `preload` ordinals are scheduled, at most `max_concurrent` jobs
/// at a time. Errors are swallowed; cancellation stops everything at once.
pub struct Prefetcher {
    tx: mpsc::UnboundedSender<(String, i64)>,
}

impl Prefetcher {
    pub fn spawn(
        fetcher: Arc<SegmentFetcher>,
        preload: usize,
        max_concurrent: usize,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<(String, i64)>();
        let slots = Arc::new(Semaphore::new(max_concurrent.max(1)));
        tokio::spawn(async move {
            loop {
                let job = tokio::select! {
                    _ = cancel.cancelled() => break,
                    job = rx.recv() => match job {
                        Some(job) => job,
                        None => break,
                    },
                };
                let (video_id, after) = job;
                for step in 1..=preload as i64 {
                    let fetcher = Arc::clone(&fetcher);
                    let slots = Arc::clone(&slots);
                    let cancel = cancel.clone();
                    let video_id = video_id.clone();
                    tokio::spawn(async move {
                        let _slot = match slots.acquire_owned().await {
                            Ok(slot) => slot,
                            Err(_) => return,
                        };
                        if cancel.is_cancelled() {
                            return;
                        }
                        if let Some(success) =
                            fetcher.prefetch_one(&video_id, after + step).await
                        {
                            fetcher.cache().record_prefetch(success);
                        }
                    });
                }
            }
            debug!(target: "prefetch", "prefetcher stopped");
        });
        Self { tx }
    }

    /// Report the playhead; a no-op after shutdown.
    pub fn schedule(&self, video_id: &str, after_ordinal: i64) {
        let _ = self.tx.send((video_id.to_string(), after_ordinal));
    }
}
