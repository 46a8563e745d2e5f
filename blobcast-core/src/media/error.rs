use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("failed to spawn {program}: {source}")]
    Spawn { program: String, source: io::Error },
    #[error("{program} exited with {status:?}: {stderr}")]
    CommandFailed {
        program: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("{program} timed out after {seconds}s")]
    Timeout { program: String, seconds: u64 },
    #[error("probe output unreadable: {0}")]
    Probe(String),
    #[error("local playlist unreadable: {0}")]
    PlaylistParse(String),
    #[error("io error at {}: {source}", path.display())]
    Io { source: io::Error, path: PathBuf },
}

pub type TranscodeResult<T> = Result<T, TranscodeError>;
