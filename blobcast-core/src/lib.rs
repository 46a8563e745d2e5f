//! Blobcast core library.
//!
//! Turns a multi-account chat/file platform into a video store and serves
//! the stored video back as HLS:
//! - `planner`: chooses a segmentation that satisfies the per-segment cap
//! - `distributor`: deterministic multi-account uploads
//! - `cache`: byte-bounded segment cache, single-flight fetches, prefetch
//! - `hls` + `server`: playlist generation and the streaming HTTP surface
//! - `catalog`: the sqlite metadata store the subsystems share
//! - `ingest`: orchestration of ingest, delete and startup resume

pub mod cache;
pub mod catalog;
pub mod config;
pub mod distributor;
pub mod error;
pub mod hls;
pub mod ingest;
pub mod logging;
pub mod media;
pub mod planner;
pub mod remote;
pub mod server;
pub mod sqlite;
pub mod testing;

pub use cache::{
    CacheStatsSnapshot, DiskCache, FetchError, MemoryCache, Prefetcher, SegmentCache,
    SegmentFetcher, SegmentKey,
};
pub use catalog::{
    CatalogError, CatalogMetrics, CatalogResult, SegmentRecord, SqliteCatalogStore,
    SubtitleTrackRecord, VideoRecord, VideoStatus,
};
pub use config::{load_config, AccountConfig, BlobcastConfig, CacheKind, PLATFORM_FILE_LIMIT};
pub use distributor::{assign_account, UploadDistributor};
pub use error::ConfigError;
pub use ingest::{IngestCoordinator, IngestError, JobPhase, JobRegistry};
pub use media::{FfmpegEngine, MediaEngine, MediaInfo, TranscodeError};
pub use planner::{SegmentPlan, SegmentPlanner};
pub use remote::{BotApiClient, RemoteError, RemoteHandle, RemoteStore};
pub use server::{AppState, BootstrapError};
