use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::media::TranscodeError;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("probe failed: {0}")]
    Probe(#[source] TranscodeError),
    #[error("transcode failed: {0}")]
    Transcode(#[source] TranscodeError),
    #[error("source has no video track")]
    NoVideoTrack,
    #[error("segment {ordinal} is {byte_size} bytes, above the {cap} byte cap")]
    Oversize {
        ordinal: u32,
        byte_size: u64,
        cap: u64,
    },
    #[error("io error at {}: {source}", path.display())]
    Io { source: io::Error, path: PathBuf },
    #[error("plan manifest error: {0}")]
    Manifest(#[from] serde_json::Error),
}

pub type PlanResult<T> = Result<T, PlanError>;
