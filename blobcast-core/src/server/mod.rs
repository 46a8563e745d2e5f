mod error;
mod hls_routes;
mod system;
mod upload;
mod videos;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::cache::{DiskCache, MemoryCache, Prefetcher, SegmentCache, SegmentFetcher};
use crate::catalog::{CatalogError, SqliteCatalogStore};
use crate::config::{BlobcastConfig, CacheKind};
use crate::ingest::{IngestCoordinator, JobRegistry};
use crate::media::MediaEngine;
use crate::remote::RemoteStore;

pub use error::{ApiError, ApiResult};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("failed to prepare data directories: {0}")]
    Io(#[from] io::Error),
}

/// Everything a handler needs, constructed once and cloned per request.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<BlobcastConfig>,
    pub catalog: SqliteCatalogStore,
    pub cache: SegmentCache,
    pub fetcher: Arc<SegmentFetcher>,
    pub prefetcher: Arc<Prefetcher>,
    pub ingest: Arc<IngestCoordinator>,
    pub jobs: Arc<JobRegistry>,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        config: BlobcastConfig,
        engine: Arc<dyn MediaEngine>,
        remote: Arc<dyn RemoteStore>,
    ) -> Result<Self, BootstrapError> {
        let config = Arc::new(config);
        std::fs::create_dir_all(&config.storage.data_dir)?;
        std::fs::create_dir_all(&config.storage.scratch_dir)?;
        if let Some(parent) = config.storage.database_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let catalog = SqliteCatalogStore::new(&config.storage.database_path)?;
        catalog.initialize()?;

        let ttl = match config.cache.ttl_s {
            0 => None,
            seconds => Some(Duration::from_secs(seconds)),
        };
        let backend: Box<dyn crate::cache::CacheBackend> = match config.cache.kind {
            CacheKind::Memory => Box::new(MemoryCache::new(config.cache.size_bytes, ttl)),
            CacheKind::Disk => Box::new(DiskCache::open(
                &config.storage.cache_dir,
                config.cache.size_bytes,
                ttl,
            )?),
        };
        let cache = SegmentCache::new(backend);

        let accounts_by_id = config
            .accounts
            .iter()
            .enumerate()
            .map(|(index, account)| (config.account_id(index), account.clone()))
            .collect();
        let fetcher = Arc::new(SegmentFetcher::new(
            catalog.clone(),
            Arc::clone(&remote),
            accounts_by_id,
            cache.clone(),
        ));

        let shutdown = CancellationToken::new();
        // prefetch dies immediately on shutdown, ahead of the grace period
        let prefetcher = Arc::new(Prefetcher::spawn(
            Arc::clone(&fetcher),
            config.cache.preload_segments,
            config.cache.max_concurrent_preloads,
            shutdown.child_token(),
        ));

        let jobs = JobRegistry::new();
        let ingest = Arc::new(IngestCoordinator::new(
            Arc::clone(&config),
            catalog.clone(),
            engine,
            remote,
            Arc::clone(&jobs),
        ));

        Ok(Self {
            config,
            catalog,
            cache,
            fetcher,
            prefetcher,
            ingest,
            jobs,
            shutdown,
        })
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/videos", get(videos::list_videos))
        .route(
            "/api/videos/{id}",
            get(videos::get_video).delete(videos::delete_video),
        )
        .route("/api/upload", post(upload::upload_video))
        .route("/api/upload/{job}/progress", get(upload::upload_progress))
        .route("/hls/{id}/master.m3u8", get(hls_routes::master_playlist))
        .route(
            "/hls/{id}/subtitles/{lang}",
            get(hls_routes::serve_subtitle),
        )
        .route(
            "/hls/{id}/{track}/playlist.m3u8",
            get(hls_routes::media_playlist),
        )
        .route("/hls/{id}/{track}/{segment}", get(hls_routes::serve_segment))
        .route("/api/system/cache/stats", get(system::cache_stats))
        .route("/api/system/cache/clear", post(system::cache_clear))
        // video uploads are far larger than the default body cap; the
        // handler streams to disk in bounded chunks
        .layer(axum::extract::DefaultBodyLimit::disable())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the shutdown token fires, then give in-flight
/// requests a bounded grace period.
pub async fn serve(state: AppState) -> io::Result<()> {
    let address = SocketAddr::new(state.config.server.host, state.config.server.port);
    let listener = TcpListener::bind(address).await?;
    info!(target: "server", %address, base = %state.config.base_url(), "listening");

    let shutdown = state.shutdown.clone();
    let graceful = shutdown.clone();
    let app = router(state);
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        graceful.cancelled().await;
    });
    let server = async move { server.await };

    tokio::select! {
        result = server => result,
        _ = async {
            shutdown.cancelled().await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        } => {
            warn!(target: "server", "grace period elapsed, aborting remaining requests");
            Ok(())
        }
    }
}
