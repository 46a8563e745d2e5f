mod client;
mod error;

use std::fmt;
use std::pin::Pin;
use std::str::FromStr;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

use crate::config::AccountConfig;

pub use client::BotApiClient;
pub use error::{RemoteError, RemoteResult};

/// Opaque handle to an uploaded file: the platform's message id (needed for
/// deletion) and file id (needed for retrieval), serialized as
/// `<message_id>/<file_id>` in the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHandle {
    pub message_id: i64,
    pub file_id: String,
}

impl fmt::Display for RemoteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.message_id, self.file_id)
    }
}

impl FromStr for RemoteHandle {
    type Err = RemoteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (message_id, file_id) = s
            .split_once('/')
            .ok_or_else(|| RemoteError::InvalidHandle(s.to_string()))?;
        let message_id = message_id
            .parse()
            .map_err(|_| RemoteError::InvalidHandle(s.to_string()))?;
        Ok(Self {
            message_id,
            file_id: file_id.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteFileInfo {
    pub remote_path: String,
    pub size: Option<u64>,
}

pub type ByteStream = Pin<Box<dyn Stream<Item = RemoteResult<Bytes>> + Send>>;

pub struct RemoteDownload {
    pub size: Option<u64>,
    pub stream: ByteStream,
}

/// The platform as the core sees it: an opaque per-account blob store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn upload(
        &self,
        account: &AccountConfig,
        bytes: Bytes,
        filename: &str,
    ) -> RemoteResult<RemoteHandle>;

    async fn info(
        &self,
        account: &AccountConfig,
        handle: &RemoteHandle,
    ) -> RemoteResult<RemoteFileInfo>;

    async fn download(
        &self,
        account: &AccountConfig,
        handle: &RemoteHandle,
    ) -> RemoteResult<RemoteDownload>;

    /// Best-effort removal; callers log and continue on failure.
    async fn delete(&self, account: &AccountConfig, handle: &RemoteHandle) -> RemoteResult<()>;

    async fn ping(&self, account: &AccountConfig) -> RemoteResult<()>;
}
