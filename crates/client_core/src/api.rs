//! HTTP endpoints: conversation history and file upload.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use shared::{
    domain::{MessageKind, UserId},
    protocol::{HistoryQuery, MessagePayload, UploadResponse},
};
use tracing::debug;
use url::Url;

/// A file picked for sending, already read into memory.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingFile {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl OutgoingFile {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            bytes,
        }
    }

    pub async fn read(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let mime_type = mime_guess::from_path(path)
            .first_raw()
            .unwrap_or("application/octet-stream")
            .to_string();
        Ok(Self::new(name, mime_type, bytes))
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

#[async_trait]
pub trait HistoryApi: Send + Sync {
    /// Most recent `limit` messages with `peer`, oldest first.
    async fn fetch_history(&self, peer: &UserId, limit: u32) -> Result<Vec<MessagePayload>>;
}

#[async_trait]
pub trait UploadApi: Send + Sync {
    async fn upload(
        &self,
        file: &OutgoingFile,
        recipient: &UserId,
        kind: MessageKind,
    ) -> Result<UploadResponse>;
}

pub struct HttpApi {
    http: reqwest::Client,
    server_url: String,
    token: String,
}

impl HttpApi {
    pub fn new(server_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            server_url: server_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    /// `server_url` with `segments` appended, each percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.server_url)
            .with_context(|| format!("invalid server url {}", self.server_url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("server url {} cannot take a path", self.server_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

#[async_trait]
impl HistoryApi for HttpApi {
    async fn fetch_history(&self, peer: &UserId, limit: u32) -> Result<Vec<MessagePayload>> {
        let messages: Vec<MessagePayload> = self
            .http
            .get(self.endpoint(&["conversations", peer.as_str(), "messages"])?)
            .bearer_auth(&self.token)
            .query(&HistoryQuery { limit })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("invalid history payload")?;
        debug!(peer = %peer, count = messages.len(), "api: history fetched");
        Ok(messages)
    }
}

#[async_trait]
impl UploadApi for HttpApi {
    async fn upload(
        &self,
        file: &OutgoingFile,
        recipient: &UserId,
        kind: MessageKind,
    ) -> Result<UploadResponse> {
        let response: UploadResponse = self
            .http
            .post(self.endpoint(&["upload"])?)
            .bearer_auth(&self.token)
            .query(&[
                ("recipient_id", recipient.as_str()),
                ("kind", kind.as_str()),
                ("filename", file.name.as_str()),
                ("mime_type", file.mime_type.as_str()),
            ])
            .body(file.bytes.clone())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("invalid upload response")?;
        debug!(file = %file.name, size = file.size(), "api: uploaded");
        Ok(response)
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
