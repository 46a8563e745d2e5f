use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use blobcast_core::catalog::CatalogMetrics;
use blobcast_core::config::BlobcastConfig;
use blobcast_core::ingest::JobPhase;
use blobcast_core::server::BootstrapError;
use blobcast_core::{
    load_config, AppState, BotApiClient, CatalogError, ConfigError, FfmpegEngine, IngestError,
    MediaEngine, RemoteError, RemoteStore, SqliteCatalogStore, VideoStatus,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("database error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("ingest error: {0}")]
    Ingest(#[from] IngestError),
    #[error("platform error: {0}")]
    Remote(#[from] RemoteError),
    #[error("startup error: {0}")]
    Bootstrap(#[from] BootstrapError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("required resource missing: {0}")]
    MissingResource(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{failed} of {total} accounts failed the ping check")]
    AccountsUnhealthy { failed: usize, total: usize },
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Blobcast command-line control interface", long_about = None)]
pub struct Cli {
    /// Path to blobcast.toml
    #[arg(long, default_value = "configs/blobcast.toml")]
    pub config: PathBuf,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the streaming HTTP server
    Serve,
    /// Ingest one local video file
    Upload(UploadArgs),
    /// List catalog videos
    List(ListArgs),
    /// Delete a video and its remote blobs
    Delete(DeleteArgs),
    /// Ping every configured account
    TestBots,
    /// Print the effective configuration
    Config,
    /// Print catalog statistics
    DbStats,
}

#[derive(Args, Debug)]
pub struct UploadArgs {
    /// Path to the source video file
    pub path: PathBuf,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Filter by status (processing, active, error)
    #[arg(long)]
    pub status: Option<String>,
    /// Maximum rows returned
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct DeleteArgs {
    /// Video id to delete
    pub id: String,
}

pub async fn run(cli: Cli) -> Result<()> {
    blobcast_core::logging::init("info");
    let config = load_config(&cli.config)?;

    match &cli.command {
        Commands::Serve => serve(config).await,
        Commands::Upload(args) => {
            let report = upload(config, args).await?;
            render(&report, cli.format)
        }
        Commands::List(args) => {
            let list = list(&config, args)?;
            render(&list, cli.format)
        }
        Commands::Delete(args) => {
            let report = delete(config, args).await?;
            render(&report, cli.format)
        }
        Commands::TestBots => {
            let report = test_bots(&config).await?;
            let any_failed = report.accounts.iter().any(|entry| !entry.ok);
            render(&report, cli.format)?;
            if any_failed {
                return Err(AppError::AccountsUnhealthy {
                    failed: report.accounts.iter().filter(|entry| !entry.ok).count(),
                    total: report.accounts.len(),
                });
            }
            Ok(())
        }
        Commands::Config => {
            let dump = config_dump(&config);
            render(&dump, cli.format)
        }
        Commands::DbStats => {
            let stats = db_stats(&config)?;
            render(&stats, cli.format)
        }
    }
}

fn build_state(config: BlobcastConfig) -> Result<AppState> {
    let engine: Arc<dyn MediaEngine> = Arc::new(FfmpegEngine::from_config(&config.media));
    let remote: Arc<dyn RemoteStore> = Arc::new(BotApiClient::new()?);
    Ok(AppState::new(config, engine, remote)?)
}

async fn serve(config: BlobcastConfig) -> Result<()> {
    let engine = FfmpegEngine::from_config(&config.media);
    if let Err(err) = engine.verify().await {
        warn!(target: "cli", "ffmpeg check failed, ingest will not work: {err}");
    }
    let state = build_state(config)?;

    // pick up ingests interrupted by the last shutdown
    let resume_state = state.clone();
    tokio::spawn(async move {
        match resume_state
            .ingest
            .resume_on_startup(resume_state.shutdown.child_token())
            .await
        {
            Ok(0) => {}
            Ok(resumed) => info!(target: "cli", resumed, "resumed interrupted ingests"),
            Err(err) => warn!(target: "cli", "startup resume failed: {err}"),
        }
    });

    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(target: "cli", "shutdown requested");
            shutdown.cancel();
        }
    });

    blobcast_core::server::serve(state).await?;
    Ok(())
}

async fn upload(config: BlobcastConfig, args: &UploadArgs) -> Result<UploadReport> {
    if !args.path.exists() {
        return Err(AppError::MissingResource(format!(
            "file not found: {}",
            args.path.display()
        )));
    }
    let filename = args
        .path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| AppError::InvalidArgument("source path has no filename".to_string()))?
        .to_string();

    let state = build_state(config)?;
    let tracker = state.jobs.create();

    // stage a copy so the source file stays where the operator left it
    let incoming = state.config.storage.scratch_dir.join("incoming");
    tokio::fs::create_dir_all(&incoming).await?;
    let staged = incoming.join(format!("{}.upload", tracker.job_id()));
    tokio::fs::copy(&args.path, &staged).await?;

    let video_id = state
        .ingest
        .ingest_file(&staged, &filename, &tracker, CancellationToken::new())
        .await?;
    let video = state
        .catalog
        .video_by_id(&video_id)?
        .ok_or_else(|| AppError::MissingResource(format!("video {video_id} vanished")))?;
    Ok(UploadReport {
        video_id,
        segments: video.total_segments,
        byte_size: video.byte_size,
        duration_s: video.duration,
        playlist: format!("{}/hls/{}/master.m3u8", state.config.base_url(), video.id),
        phase: JobPhase::Done,
    })
}

fn open_catalog(config: &BlobcastConfig) -> Result<SqliteCatalogStore> {
    if !config.storage.database_path.exists() {
        return Err(AppError::MissingResource(format!(
            "catalog database missing: {}",
            config.storage.database_path.display()
        )));
    }
    Ok(SqliteCatalogStore::builder()
        .path(&config.storage.database_path)
        .read_only(true)
        .create_if_missing(false)
        .build()?)
}

fn list(config: &BlobcastConfig, args: &ListArgs) -> Result<VideoList> {
    let status = match &args.status {
        Some(value) => Some(
            value
                .parse::<VideoStatus>()
                .map_err(AppError::InvalidArgument)?,
        ),
        None => None,
    };
    let catalog = open_catalog(config)?;
    let rows = catalog
        .list_videos(status, args.limit, 0)?
        .into_iter()
        .map(|video| VideoEntry {
            id: video.id,
            filename: video.filename,
            status: video.status.to_string(),
            duration_s: video.duration,
            segments: video.total_segments,
            byte_size: video.byte_size,
            error_reason: video.error_reason,
        })
        .collect();
    Ok(VideoList { rows })
}

async fn delete(config: BlobcastConfig, args: &DeleteArgs) -> Result<DeleteReport> {
    let state = build_state(config)?;
    if state.ingest.delete_video(&args.id).await? {
        Ok(DeleteReport {
            deleted: args.id.clone(),
        })
    } else {
        Err(AppError::MissingResource(format!(
            "video {} not found",
            args.id
        )))
    }
}

async fn test_bots(config: &BlobcastConfig) -> Result<PingReport> {
    let remote = BotApiClient::new()?;
    let mut accounts = Vec::new();
    for (index, account) in config.accounts.iter().enumerate() {
        let id = config.account_id(index);
        let result = remote.ping(account).await;
        accounts.push(PingEntry {
            id,
            chat_id: account.chat_id.clone(),
            ok: result.is_ok(),
            detail: result.err().map(|err| err.to_string()),
        });
    }
    Ok(PingReport { accounts })
}

fn config_dump(config: &BlobcastConfig) -> ConfigDump {
    ConfigDump {
        base_url: config.base_url(),
        bind: format!("{}:{}", config.server.host, config.server.port),
        database_path: config.storage.database_path.display().to_string(),
        scratch_dir: config.storage.scratch_dir.display().to_string(),
        max_segment_bytes: config.segments.max_segment_bytes,
        segment_duration_range: (config.segments.min_duration, config.segments.max_duration),
        cache_kind: format!("{:?}", config.cache.kind).to_lowercase(),
        cache_size_bytes: config.cache.size_bytes,
        preload_segments: config.cache.preload_segments,
        upload_concurrency: config.upload.concurrency,
        upload_retries: config.upload.retries,
        accounts: config
            .accounts
            .iter()
            .enumerate()
            .map(|(index, account)| AccountDump {
                id: config.account_id(index),
                token_preview: preview_token(&account.token),
                chat_id: account.chat_id.clone(),
            })
            .collect(),
    }
}

fn preview_token(token: &str) -> String {
    let head: String = token.chars().take(8).collect();
    format!("{head}...")
}

fn db_stats(config: &BlobcastConfig) -> Result<DbStats> {
    let catalog = open_catalog(config)?;
    let metrics = catalog.compute_metrics()?;
    Ok(DbStats { metrics })
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(value)?);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug, Serialize)]
pub struct UploadReport {
    pub video_id: String,
    pub segments: i64,
    pub byte_size: i64,
    pub duration_s: f64,
    pub playlist: String,
    pub phase: JobPhase,
}

impl DisplayFallback for UploadReport {
    fn display(&self) -> String {
        format!(
            "Ingested {id}: {segments} segments, {mib:.1} MiB, {duration:.1}s\nPlaylist: {playlist}",
            id = self.video_id,
            segments = self.segments,
            mib = self.byte_size as f64 / (1024.0 * 1024.0),
            duration = self.duration_s,
            playlist = self.playlist,
        )
    }
}

#[derive(Debug, Serialize)]
pub struct VideoList {
    pub rows: Vec<VideoEntry>,
}

#[derive(Debug, Serialize)]
pub struct VideoEntry {
    pub id: String,
    pub filename: String,
    pub status: String,
    pub duration_s: f64,
    pub segments: i64,
    pub byte_size: i64,
    pub error_reason: Option<String>,
}

impl DisplayFallback for VideoList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No videos in the catalog".to_string();
        }
        let mut lines = Vec::new();
        for entry in &self.rows {
            let mut line = format!(
                "{id} | {status} | {segments} segments | {mib:.1} MiB | {duration:.1}s | {filename}",
                id = entry.id,
                status = entry.status,
                segments = entry.segments,
                mib = entry.byte_size as f64 / (1024.0 * 1024.0),
                duration = entry.duration_s,
                filename = entry.filename,
            );
            if let Some(reason) = &entry.error_reason {
                line.push_str(&format!(" | reason={reason}"));
            }
            lines.push(line);
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct DeleteReport {
    pub deleted: String,
}

impl DisplayFallback for DeleteReport {
    fn display(&self) -> String {
        format!("Deleted {}", self.deleted)
    }
}

#[derive(Debug, Serialize)]
pub struct PingReport {
    pub accounts: Vec<PingEntry>,
}

#[derive(Debug, Serialize)]
pub struct PingEntry {
    pub id: String,
    pub chat_id: String,
    pub ok: bool,
    pub detail: Option<String>,
}

impl DisplayFallback for PingReport {
    fn display(&self) -> String {
        self.accounts
            .iter()
            .map(|entry| {
                let status = if entry.ok { "OK" } else { "FAIL" };
                let mut line = format!("[{status}] {} ({})", entry.id, entry.chat_id);
                if let Some(detail) = &entry.detail {
                    line.push_str(&format!(" — {detail}"));
                }
                line
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct ConfigDump {
    pub base_url: String,
    pub bind: String,
    pub database_path: String,
    pub scratch_dir: String,
    pub max_segment_bytes: u64,
    pub segment_duration_range: (u32, u32),
    pub cache_kind: String,
    pub cache_size_bytes: u64,
    pub preload_segments: usize,
    pub upload_concurrency: usize,
    pub upload_retries: u32,
    pub accounts: Vec<AccountDump>,
}

#[derive(Debug, Serialize)]
pub struct AccountDump {
    pub id: String,
    pub token_preview: String,
    pub chat_id: String,
}

impl DisplayFallback for ConfigDump {
    fn display(&self) -> String {
        let mut lines = vec![
            format!("Base URL: {}", self.base_url),
            format!("Bind: {}", self.bind),
            format!("Database: {}", self.database_path),
            format!("Scratch: {}", self.scratch_dir),
            format!(
                "Segments: cap {:.1} MiB, duration {}..{}s",
                self.max_segment_bytes as f64 / (1024.0 * 1024.0),
                self.segment_duration_range.0,
                self.segment_duration_range.1
            ),
            format!(
                "Cache: {} ({:.0} MiB, preload {})",
                self.cache_kind,
                self.cache_size_bytes as f64 / (1024.0 * 1024.0),
                self.preload_segments
            ),
            format!(
                "Uploads: concurrency {}, retries {}",
                self.upload_concurrency, self.upload_retries
            ),
            format!("Accounts ({}):", self.accounts.len()),
        ];
        for account in &self.accounts {
            lines.push(format!(
                "  - {} {} → {}",
                account.id, account.token_preview, account.chat_id
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct DbStats {
    pub metrics: CatalogMetrics,
}

impl DisplayFallback for DbStats {
    fn display(&self) -> String {
        let mut lines = vec![
            format!("Videos: {}", self.metrics.videos),
            format!("Segments: {}", self.metrics.segments),
            format!(
                "Stored bytes: {:.1} MiB",
                self.metrics.total_bytes as f64 / (1024.0 * 1024.0)
            ),
        ];
        let mut statuses: Vec<_> = self.metrics.by_status.iter().collect();
        statuses.sort();
        for (status, count) in statuses {
            lines.push(format!("  - {status}: {count}"));
        }
        lines.join("\n")
    }
}
