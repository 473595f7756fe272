//! A `Host` reached over HTTP.
//!
//! Endpoints, relative to the configured base URL:
//! - `GET  /ready` answers 2xx once the host can serve requests
//! - `POST /completions` streams `data: {"content": ..., "done": ...}` events,
//!   where `content` is the cumulative text so far
//! - `PUT|GET|DELETE /kv/{key}` for the key-value store

use crate::{ChunkCallback, CompletionRequest, Error, Host};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Connection settings for an `HttpHost`.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl HostConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            request_timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(30),
        }
    }

    /// Read `XIUXIAN_HOST_URL` and, optionally, `XIUXIAN_API_KEY`.
    pub fn from_env() -> Result<Self, Error> {
        let base_url = std::env::var("XIUXIAN_HOST_URL")
            .map_err(|_| Error::Config("XIUXIAN_HOST_URL is not set".to_string()))?;
        if base_url.trim().is_empty() {
            return Err(Error::Config("XIUXIAN_HOST_URL is empty".to_string()));
        }

        let mut config = Self::new(base_url.trim());
        if let Ok(key) = std::env::var("XIUXIAN_API_KEY") {
            if !key.is_empty() {
                config.api_key = Some(key);
            }
        }
        Ok(config)
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

/// HTTP implementation of `Host`.
///
/// Presence is whatever the last `probe` found; a fresh client is absent
/// until probed.
pub struct HttpHost {
    client: reqwest::Client,
    config: HostConfig,
    present: AtomicBool,
}

impl HttpHost {
    pub fn new(config: HostConfig) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            config,
            present: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Ask the host whether it is ready and remember the answer.
    pub async fn probe(&self) -> bool {
        let result = self
            .client
            .get(self.config.url("ready"))
            .headers(self.build_headers().unwrap_or_default())
            .send()
            .await;

        let present = match result {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(error = %e, "Host probe failed");
                false
            }
        };
        self.present.store(present, Ordering::SeqCst);
        present
    }

    fn build_headers(&self) -> Result<HeaderMap, Error> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = &self.config.api_key {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {key}"))
                    .map_err(|e| Error::Config(format!("Invalid API key: {e}")))?,
            );
        }
        Ok(headers)
    }

    fn kv_url(&self, key: &str) -> String {
        self.config.url(&format!("kv/{key}"))
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, Error> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(Error::Api {
            status,
            message: body,
        })
    }
}

#[derive(Serialize, Deserialize)]
struct KvBody {
    value: Value,
}

#[async_trait]
impl Host for HttpHost {
    fn is_present(&self) -> bool {
        self.present.load(Ordering::SeqCst)
    }

    async fn completions(
        &self,
        request: &CompletionRequest,
        on_chunk: ChunkCallback<'_>,
    ) -> Result<(), Error> {
        let response = self
            .client
            .post(self.config.url("completions"))
            .headers(self.build_headers()?)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        let response = Self::check(response).await?;

        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        let mut latest = String::new();

        while let Some(result) = stream.next().await {
            let bytes = result.map_err(|e| Error::Network(e.to_string()))?;
            buffer.extend_from_slice(&bytes);

            for event in parse_sse_events_buffered(&mut buffer) {
                match event? {
                    SseEvent::Chunk { content, done } => {
                        on_chunk(&content, done);
                        if done {
                            return Ok(());
                        }
                        latest = content;
                    }
                    SseEvent::Done => {
                        on_chunk(&latest, true);
                        return Ok(());
                    }
                }
            }
        }

        tracing::debug!("Completion stream ended without a done marker");
        Ok(())
    }

    async fn kv_put(&self, key: &str, value: &Value) -> Result<(), Error> {
        let response = self
            .client
            .put(self.kv_url(key))
            .headers(self.build_headers()?)
            .json(&KvBody {
                value: value.clone(),
            })
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        Self::check(response).await?;
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<Value>, Error> {
        let response = self
            .client
            .get(self.kv_url(key))
            .headers(self.build_headers()?)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: KvBody = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| Error::Parse(e.to_string()))?;

        Ok(match body.value {
            Value::Null => None,
            value => Some(value),
        })
    }

    async fn kv_delete(&self, key: &str) -> Result<(), Error> {
        let response = self
            .client
            .delete(self.kv_url(key))
            .headers(self.build_headers()?)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(response).await?;
        Ok(())
    }
}

// ============================================================================
// SSE parsing
// ============================================================================

#[derive(Debug, PartialEq)]
enum SseEvent {
    Chunk { content: String, done: bool },
    Done,
}

#[derive(Deserialize)]
struct ApiChunk {
    #[serde(default)]
    content: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Parse every complete line in `buffer`, leaving any trailing partial line.
///
/// The buffer holds raw bytes so a multi-byte character split across two
/// network chunks is only decoded once both halves have arrived.
fn parse_sse_events_buffered(buffer: &mut Vec<u8>) -> Vec<Result<SseEvent, Error>> {
    let mut events = Vec::new();

    while let Some(newline_pos) = buffer.iter().position(|&b| b == b'\n') {
        let line_bytes: Vec<u8> = buffer.drain(..=newline_pos).collect();
        let line = String::from_utf8_lossy(&line_bytes);
        let line = line.trim_end_matches(['\n', '\r']);

        // event:, id:, comments and blank separators carry nothing we need
        let Some(json_str) = line.strip_prefix("data:") else {
            continue;
        };
        let json_str = json_str.trim_start();

        if json_str == "[DONE]" {
            events.push(Ok(SseEvent::Done));
        } else if !json_str.is_empty() {
            match serde_json::from_str::<ApiChunk>(json_str) {
                Ok(ApiChunk {
                    error: Some(message),
                    ..
                }) => events.push(Err(Error::Stream(message))),
                Ok(chunk) => events.push(Ok(SseEvent::Chunk {
                    content: chunk.content,
                    done: chunk.done,
                })),
                Err(e) => events.push(Err(Error::Parse(format!("SSE parse error: {e}")))),
            }
        }
    }

    events
}
