use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("platform api error {status}: {message}")]
    Api { status: i64, message: String },
    #[error("rate limited, retry after {retry_after_s}s")]
    RateLimited { retry_after_s: u64 },
    #[error("{op} timed out")]
    Timeout { op: &'static str },
    #[error("network error: {0}")]
    Network(String),
    #[error("file of {size} bytes exceeds the {limit} byte platform limit")]
    TooLarge { size: u64, limit: u64 },
    #[error("malformed remote handle: {0}")]
    InvalidHandle(String),
}

impl RemoteError {
    /// Errors worth a retry at the caller's policy.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteError::Network(_)
                | RemoteError::Timeout { .. }
                | RemoteError::RateLimited { .. }
                | RemoteError::Api { status: 500..=599, .. }
        )
    }

    /// Suggested wait before retrying, when the platform provided one.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            RemoteError::RateLimited { retry_after_s } => Some(*retry_after_s),
            _ => None,
        }
    }

    pub(crate) fn from_reqwest(op: &'static str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RemoteError::Timeout { op }
        } else {
            RemoteError::Network(err.to_string())
        }
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;
