use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use rand::Rng;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::catalog::{CatalogError, SegmentRecord, SqliteCatalogStore};
use crate::config::{AccountConfig, UploadSection};
use crate::planner::{PlannedSegment, SegmentPlan};
use crate::remote::{RemoteError, RemoteStore};

const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_CAP_S: u64 = 30;

#[derive(Debug, Error)]
pub enum DistributorError {
    #[error("upload of segment {ordinal} failed: {source}")]
    Upload {
        ordinal: u32,
        source: RemoteError,
    },
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("failed to read segment {ordinal} from disk: {source}")]
    Read {
        ordinal: u32,
        source: std::io::Error,
    },
    #[error("distribution cancelled")]
    Cancelled,
}

pub type DistributorResult<T> = Result<T, DistributorError>;

/// FNV-1a, the stable non-cryptographic hash behind account assignment.
pub fn fnv1a64(input: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in input.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Deterministic account index for segment `ordinal` of `video_id`: the
/// video-level hash offset spreads videos across accounts, the `+ ordinal`
/// sweep spreads one video's segments for parallel downloads.
pub fn assign_account(video_id: &str, ordinal: usize, accounts: usize) -> usize {
    debug_assert!(accounts > 0);
    (fnv1a64(video_id) as usize).wrapping_add(ordinal) % accounts
}

/// Uploads a planned segment list with bounded parallelism and commits one
/// catalog row per success, strictly in ordinal order.
pub struct UploadDistributor {
    remote: Arc<dyn RemoteStore>,
    catalog: SqliteCatalogStore,
    accounts: Vec<AccountConfig>,
    account_ids: Vec<String>,
    concurrency: usize,
    retries: u32,
}

struct CommitState {
    next: u32,
    parked: BTreeMap<u32, SegmentRecord>,
    uploaded_bytes: u64,
}

impl UploadDistributor {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        catalog: SqliteCatalogStore,
        accounts: Vec<AccountConfig>,
        account_ids: Vec<String>,
        upload: &UploadSection,
    ) -> Self {
        Self {
            remote,
            catalog,
            accounts,
            account_ids,
            concurrency: upload.concurrency.max(1),
            retries: upload.retries.max(1),
        }
    }

    /// Upload every segment of `plan` not in `committed` and persist its
    /// `(handle, account_id)` row. Progress is reported as cumulative
    /// uploaded bytes.
    pub async fn distribute<F>(
        &self,
        plan: &SegmentPlan,
        committed: &HashSet<u32>,
        cancel: &CancellationToken,
        progress: F,
    ) -> DistributorResult<()>
    where
        F: Fn(u64) + Send + Sync,
    {
        let account_count = self.accounts.len();
        let per_account = self.concurrency.div_ceil(account_count).max(1);
        let account_slots: Vec<Arc<Semaphore>> = (0..account_count)
            .map(|_| Arc::new(Semaphore::new(per_account)))
            .collect();

        let next = plan
            .segments
            .iter()
            .map(|segment| segment.ordinal)
            .filter(|ordinal| !committed.contains(ordinal))
            .min()
            .unwrap_or(plan.segments.len() as u32);
        let state = Mutex::new(CommitState {
            next,
            parked: BTreeMap::new(),
            uploaded_bytes: 0,
        });
        let progress = &progress;
        let state = &state;
        let account_slots = &account_slots;

        let pending: Vec<PlannedSegment> = plan
            .segments
            .iter()
            .filter(|segment| !committed.contains(&segment.ordinal))
            .cloned()
            .collect();
        info!(
            target: "distributor",
            video_id = %plan.video_id,
            pending = pending.len(),
            accounts = account_count,
            concurrency = self.concurrency,
            "distributing segments"
        );

        stream::iter(pending)
            .map(|segment| {
                self.distribute_one(
                    plan,
                    segment,
                    account_count,
                    account_slots,
                    cancel,
                    state,
                    progress,
                )
            })
            .buffer_unordered(self.concurrency)
            .try_collect::<Vec<()>>()
            .await?;
        Ok(())
    }

    async fn distribute_one<F>(
        &self,
        plan: &SegmentPlan,
        segment: PlannedSegment,
        account_count: usize,
        account_slots: &[Arc<Semaphore>],
        cancel: &CancellationToken,
        state: &Mutex<CommitState>,
        progress: &F,
    ) -> DistributorResult<()>
    where
        F: Fn(u64) + Send + Sync,
    {
        let account_index = assign_account(&plan.video_id, segment.ordinal as usize, account_count);
        let slot = account_slots[account_index]
            .acquire()
            .await
            .expect("account semaphore is never closed");
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(DistributorError::Cancelled),
            result = self.upload_segment(plan, &segment, account_index) => result,
        };
        drop(slot);
        let record = result?;
        self.commit_in_order(state, record, segment.byte_size, progress)?;
        Ok(())
    }

    async fn upload_segment(
        &self,
        plan: &SegmentPlan,
        segment: &PlannedSegment,
        account_index: usize,
    ) -> DistributorResult<SegmentRecord> {
        let account = &self.accounts[account_index];
        let account_id = self.account_ids[account_index].clone();
        let bytes = tokio::fs::read(&segment.path)
            .await
            .map(Bytes::from)
            .map_err(|source| DistributorError::Read {
                ordinal: segment.ordinal,
                source,
            })?;

        let mut attempt = 0;
        let handle = loop {
            match self
                .remote
                .upload(account, bytes.clone(), &segment.filename)
                .await
            {
                Ok(handle) => break handle,
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.retries || !err.is_transient() {
                        return Err(DistributorError::Upload {
                            ordinal: segment.ordinal,
                            source: err,
                        });
                    }
                    let wait = backoff_delay(attempt, err.retry_after());
                    warn!(
                        target: "distributor",
                        video_id = %plan.video_id,
                        ordinal = segment.ordinal,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        "upload failed, retrying: {err}"
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        };

        Ok(SegmentRecord {
            video_id: plan.video_id.clone(),
            ordinal: segment.ordinal as i64,
            filename: segment.filename.clone(),
            duration: segment.duration,
            byte_size: segment.byte_size as i64,
            handle: handle.to_string(),
            account_id,
            created_at: None,
        })
    }

    /// Park completed uploads until all lower ordinals are committed, then
    /// flush single-row inserts in order. Readers thereby never observe row
    /// `i + 1` without row `i`.
    fn commit_in_order<F>(
        &self,
        state: &Mutex<CommitState>,
        record: SegmentRecord,
        byte_size: u64,
        progress: &F,
    ) -> DistributorResult<()>
    where
        F: Fn(u64) + Send + Sync,
    {
        let mut state = state.lock().expect("commit state lock poisoned");
        state.parked.insert(record.ordinal as u32, record);
        loop {
            let next = state.next;
            let Some(record) = state.parked.remove(&next) else {
                break;
            };
            self.catalog.insert_segment(&record)?;
            state.next += 1;
        }
        state.uploaded_bytes += byte_size;
        progress(state.uploaded_bytes);
        Ok(())
    }
}

fn backoff_delay(attempt: u32, suggested_s: Option<u64>) -> Duration {
    if let Some(seconds) = suggested_s {
        return Duration::from_secs(seconds.min(BACKOFF_CAP_S));
    }
    let exp = BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.min(6));
    let jitter = rand::rng().random_range(0..BACKOFF_BASE_MS / 2);
    Duration::from_millis((exp + jitter).min(BACKOFF_CAP_S * 1000))
}
