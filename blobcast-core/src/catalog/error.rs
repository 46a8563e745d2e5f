use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to open catalog database {}: {source}", path.display())]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("catalog statement failed: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("catalog path not configured")]
    MissingStore,
    #[error("video {video_id} not found")]
    NotFound { video_id: String },
    #[error("integrity violation for video {video_id}: {detail}")]
    Integrity { video_id: String, detail: String },
}

pub type CatalogResult<T> = Result<T, CatalogError>;
