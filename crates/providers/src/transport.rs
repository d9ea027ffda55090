//! HTTP transport for OpenAI-compatible chat completion endpoints.
//!
//! The backend formats request bodies and decodes responses; this layer only
//! moves JSON. Keeping it behind [`ChatTransport`] lets the backend be
//! tested against canned responses.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use parley_core::{Error, Result};
use serde_json::Value;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, trace, warn};

/// Parsed `data:` payloads of a server-sent event stream.
pub type ChunkStream = BoxStream<'static, Result<Value>>;

#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Base URL of the endpoint, used to tell which service is behind it.
    fn base_url(&self) -> &str;

    /// POST a non-streaming completion request.
    async fn complete(&self, body: Value) -> Result<Value>;

    /// POST a streaming completion request.
    async fn stream(&self, body: Value) -> Result<ChunkStream>;
}

/// How the API key is presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    /// `Authorization: Bearer <key>`
    Bearer,
    /// `api-key: <key>` (Azure)
    ApiKeyHeader,
}

pub struct HttpTransport {
    base_url: String,
    api_key: String,
    auth: AuthStyle,
    api_version: Option<String>,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|e| Error::Transport(format!("Failed to create HTTP client: {e}")))?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let auth = if base_url.contains("openai.azure.com") {
            AuthStyle::ApiKeyHeader
        } else {
            AuthStyle::Bearer
        };

        Ok(Self {
            base_url,
            api_key: api_key.into(),
            auth,
            api_version: None,
            client,
        })
    }

    /// Append `?api-version=` to every request (Azure deployments need it).
    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = Some(version.into());
        self
    }

    fn url(&self) -> String {
        match &self.api_version {
            Some(version) => format!("{}/chat/completions?api-version={version}", self.base_url),
            None => format!("{}/chat/completions", self.base_url),
        }
    }

    async fn post(&self, body: &Value, streaming: bool) -> Result<reqwest::Response> {
        let mut request = self
            .client
            .post(self.url())
            .header("Content-Type", "application/json");
        request = match self.auth {
            AuthStyle::Bearer => request.header("Authorization", format!("Bearer {}", self.api_key)),
            AuthStyle::ApiKeyHeader => request.header("api-key", &self.api_key),
        };
        if streaming {
            request = request.header("Accept", "text/event-stream");
        }

        let response = request
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        match status {
            200 => Ok(response),
            429 => Err(Error::Transport("Rate limited by the endpoint".into())),
            401 | 403 => Err(Error::Transport(
                "Invalid API key or insufficient permissions".into(),
            )),
            _ => {
                let error_body = response.text().await.unwrap_or_default();
                warn!(status, body = %error_body, "Endpoint returned error");
                Err(Error::Transport(format!("HTTP {status}: {error_body}")))
            }
        }
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn complete(&self, body: Value) -> Result<Value> {
        debug!(url = %self.base_url, "Sending completion request");
        let response = self.post(&body, false).await?;
        response
            .json()
            .await
            .map_err(|e| Error::ProtocolViolation(format!("Failed to parse response: {e}")))
    }

    async fn stream(&self, body: Value) -> Result<ChunkStream> {
        debug!(url = %self.base_url, "Sending streaming request");
        let response = self.post(&body, true).await?;

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut lines = SseLines::default();

            while let Some(chunk_result) = byte_stream.next().await {
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx.send(Err(Error::Transport(e.to_string()))).await;
                        return;
                    }
                };

                for data in lines.push(&bytes) {
                    let item = match data {
                        SseData::Done => return,
                        SseData::Payload(payload) => {
                            trace!(payload = %payload, "SSE chunk");
                            serde_json::from_str::<Value>(&payload).map_err(|e| {
                                Error::ProtocolViolation(format!("Unparseable stream chunk: {e}"))
                            })
                        }
                    };
                    if tx.send(item).await.is_err() {
                        return; // receiver dropped
                    }
                }
            }
            // A stream cut short shows up downstream as a missing finish reason.
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}

/// One `data:` payload of an event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseData {
    Payload(String),
    /// The `[DONE]` terminator.
    Done,
}

/// Splits an SSE byte stream into `data:` payloads.
///
/// Bytes may arrive cut anywhere, including inside a line or a multi-byte
/// character; incomplete lines are kept as raw bytes until the rest arrives.
#[derive(Debug, Default)]
pub struct SseLines {
    buffer: Vec<u8>,
}

impl SseLines {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseData> {
        self.buffer.extend_from_slice(bytes);
        let mut out = Vec::new();

        while let Some(line_end) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=line_end).collect();
            let line = String::from_utf8_lossy(&raw[..line_end]);
            let line = line.trim_end_matches('\r');

            // blank separators and comments
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                if data == "[DONE]" {
                    out.push(SseData::Done);
                } else if !data.is_empty() {
                    out.push(SseData::Payload(data.to_string()));
                }
            }
        }
        out
    }
}
