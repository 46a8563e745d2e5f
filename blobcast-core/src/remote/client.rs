use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::{AccountConfig, PLATFORM_FILE_LIMIT};

use super::error::{RemoteError, RemoteResult};
use super::{RemoteDownload, RemoteFileInfo, RemoteHandle, RemoteStore};

const DEFAULT_API_BASE: &str = "https://api.telegram.org";
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(600);
const INFO_TIMEOUT: Duration = Duration::from_secs(30);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);
const PING_TIMEOUT: Duration = Duration::from_secs(10);
const RATE_LIMIT_CAP_S: u64 = 30;

/// Bot-API implementation of [`RemoteStore`]. One shared connection pool;
/// per-operation timeouts on every request.
#[derive(Debug, Clone)]
pub struct BotApiClient {
    http: reqwest::Client,
    api_base: String,
}

impl BotApiClient {
    pub fn new() -> RemoteResult<Self> {
        Self::with_api_base(DEFAULT_API_BASE)
    }

    pub fn with_api_base(api_base: impl Into<String>) -> RemoteResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent("blobcast/0.4")
            .build()
            .map_err(|err| RemoteError::Network(err.to_string()))?;
        Ok(Self {
            http,
            api_base: api_base.into(),
        })
    }

    fn method_url(&self, token: &str, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, token, method)
    }

    fn file_url(&self, token: &str, remote_path: &str) -> String {
        format!("{}/file/bot{}/{}", self.api_base, token, remote_path)
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        op: &'static str,
        request: reqwest::RequestBuilder,
    ) -> RemoteResult<T> {
        let response = request
            .send()
            .await
            .map_err(|err| RemoteError::from_reqwest(op, err))?;
        let envelope: ApiEnvelope<T> = response
            .json()
            .await
            .map_err(|err| RemoteError::from_reqwest(op, err))?;
        if envelope.ok {
            return envelope.result.ok_or_else(|| RemoteError::Api {
                status: 0,
                message: "ok response without a result".to_string(),
            });
        }
        let retry_after = envelope
            .parameters
            .and_then(|parameters| parameters.retry_after);
        if envelope.error_code == Some(429) || retry_after.is_some() {
            return Err(RemoteError::RateLimited {
                retry_after_s: retry_after.unwrap_or(RATE_LIMIT_CAP_S),
            });
        }
        Err(RemoteError::Api {
            status: envelope.error_code.unwrap_or(0),
            message: envelope
                .description
                .unwrap_or_else(|| "unknown platform error".to_string()),
        })
    }

    async fn open_download(
        &self,
        account: &AccountConfig,
        handle: &RemoteHandle,
    ) -> RemoteResult<RemoteDownload> {
        let info = self.info(account, handle).await?;
        let url = self.file_url(&account.token, &info.remote_path);
        let response = self
            .http
            .get(url)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await
            .map_err(|err| RemoteError::from_reqwest("download", err))?;
        if !response.status().is_success() {
            return Err(RemoteError::Api {
                status: response.status().as_u16() as i64,
                message: format!("file endpoint returned {}", response.status()),
            });
        }
        let size = response.content_length().or(info.size);
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|err| RemoteError::from_reqwest("download", err)));
        Ok(RemoteDownload {
            size,
            stream: Box::pin(stream),
        })
    }
}

#[async_trait]
impl RemoteStore for BotApiClient {
    async fn upload(
        &self,
        account: &AccountConfig,
        bytes: Bytes,
        filename: &str,
    ) -> RemoteResult<RemoteHandle> {
        if bytes.len() as u64 > PLATFORM_FILE_LIMIT {
            return Err(RemoteError::TooLarge {
                size: bytes.len() as u64,
                limit: PLATFORM_FILE_LIMIT,
            });
        }
        debug!(
            target: "remote",
            chat = %account.chat_id,
            filename,
            size = bytes.len(),
            "uploading document"
        );
        let part = Part::bytes(bytes.to_vec())
            .file_name(filename.to_string())
            .mime_str("application/octet-stream")
            .map_err(|err| RemoteError::Network(err.to_string()))?;
        let form = Form::new()
            .text("chat_id", account.chat_id.clone())
            .text("disable_notification", "true")
            .part("document", part);
        let request = self
            .http
            .post(self.method_url(&account.token, "sendDocument"))
            .timeout(UPLOAD_TIMEOUT)
            .multipart(form);
        let message: ApiMessage = self.call("upload", request).await?;
        let document = message.document.ok_or_else(|| RemoteError::Api {
            status: 0,
            message: "upload response carried no document".to_string(),
        })?;
        Ok(RemoteHandle {
            message_id: message.message_id,
            file_id: document.file_id,
        })
    }

    async fn info(
        &self,
        account: &AccountConfig,
        handle: &RemoteHandle,
    ) -> RemoteResult<RemoteFileInfo> {
        let request = self
            .http
            .post(self.method_url(&account.token, "getFile"))
            .timeout(INFO_TIMEOUT)
            .form(&[("file_id", handle.file_id.as_str())]);
        let file: ApiFile = self.call("info", request).await?;
        let remote_path = file.file_path.ok_or_else(|| RemoteError::Api {
            status: 0,
            message: "file info carried no path".to_string(),
        })?;
        Ok(RemoteFileInfo {
            remote_path,
            size: file.file_size,
        })
    }

    async fn download(
        &self,
        account: &AccountConfig,
        handle: &RemoteHandle,
    ) -> RemoteResult<RemoteDownload> {
        // One retry for idempotent transient failures.
        match self.open_download(account, handle).await {
            Ok(download) => Ok(download),
            Err(err) if err.is_transient() => {
                let wait = err.retry_after().unwrap_or(1).min(RATE_LIMIT_CAP_S);
                warn!(
                    target: "remote",
                    handle = %handle,
                    wait_s = wait,
                    "download failed transiently, retrying once: {err}"
                );
                tokio::time::sleep(Duration::from_secs(wait)).await;
                self.open_download(account, handle).await
            }
            Err(err) => Err(err),
        }
    }

    async fn delete(&self, account: &AccountConfig, handle: &RemoteHandle) -> RemoteResult<()> {
        let request = self
            .http
            .post(self.method_url(&account.token, "deleteMessage"))
            .timeout(INFO_TIMEOUT)
            .form(&[
                ("chat_id", account.chat_id.as_str()),
                ("message_id", &handle.message_id.to_string()),
            ]);
        let _: serde_json::Value = self.call("delete", request).await?;
        Ok(())
    }

    async fn ping(&self, account: &AccountConfig) -> RemoteResult<()> {
        let request = self
            .http
            .get(self.method_url(&account.token, "getMe"))
            .timeout(PING_TIMEOUT);
        let _: serde_json::Value = self.call("ping", request).await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<i64>,
    parameters: Option<ApiParameters>,
}

#[derive(Debug, Deserialize)]
struct ApiParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    message_id: i64,
    document: Option<ApiDocument>,
}

#[derive(Debug, Deserialize)]
struct ApiDocument {
    file_id: String,
}

#[derive(Debug, Deserialize)]
struct ApiFile {
    file_path: Option<String>,
    file_size: Option<u64>,
}
