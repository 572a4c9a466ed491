use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Future, Stream};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use tracing::instrument;

use haven_core::errors::HavenError;
use haven_core::messages::{ChatChunk, ChatRequest, ChatResponse};

use crate::client::{ChatClient, ChatStream};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Chat-completions client over an OpenAI-compatible endpoint.
pub struct OpenAiClient {
    client: Client,
    base_url: String,
    api_key: Option<SecretString>,
    model: String,
}

impl OpenAiClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<SecretString>,
        model: impl Into<String>,
    ) -> Result<Self, HavenError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| HavenError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
        })
    }

    fn build_request(&self, body: &ChatRequest) -> reqwest::RequestBuilder {
        let url = format!("{}/chat/completions", self.base_url);
        let mut req = self.client.post(url);
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key.expose_secret()));
        }
        req.header("content-type", "application/json").json(body)
    }

    async fn send(&self, body: &ChatRequest) -> Result<reqwest::Response, HavenError> {
        let resp = self
            .build_request(body)
            .send()
            .await
            .map_err(|e| HavenError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(HavenError::from_status(status, text));
        }
        Ok(resp)
    }
}

#[async_trait]
impl ChatClient for OpenAiClient {
    fn model(&self) -> &str {
        &self.model
    }

    #[instrument(skip(self, request), fields(model = %self.model))]
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, HavenError> {
        let mut body = request.clone();
        body.model = self.model.clone();
        body.stream = false;

        let resp = self.send(&body).await?;
        resp.json::<ChatResponse>()
            .await
            .map_err(|e| HavenError::Protocol(format!("malformed completion body: {e}")))
    }

    #[instrument(skip(self, request), fields(model = %self.model))]
    async fn stream(&self, request: &ChatRequest) -> Result<ChatStream, HavenError> {
        let mut body = request.clone();
        body.model = self.model.clone();
        body.stream = true;

        let resp = self.send(&body).await?;
        let byte_stream = resp.bytes_stream();
        Ok(Box::pin(SseStream::new(byte_stream)))
    }
}

/// Extract `data:` payloads from one SSE frame.
fn parse_data_lines(chunk: &str) -> Vec<String> {
    chunk
        .lines()
        .filter_map(|line| {
            let line = line.trim_end_matches('\r');
            line.strip_prefix("data:").map(|d| d.trim_start().to_string())
        })
        .collect()
}

/// Wraps a byte stream from reqwest and yields parsed ChatChunks.
/// Includes an idle timeout: if no data arrives within `idle_duration`,
/// yields an error item.
struct SseStream {
    inner: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
    buffer: String,
    pending: Vec<Result<ChatChunk, HavenError>>,
    done: bool,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
}

impl SseStream {
    fn new(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
    ) -> Self {
        Self::with_idle_timeout(byte_stream, SSE_IDLE_TIMEOUT)
    }

    fn with_idle_timeout(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            buffer: String::new(),
            pending: Vec::new(),
            done: false,
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
        }
    }

    fn ingest(&mut self, frame: &str) {
        for data in parse_data_lines(frame) {
            if data == "[DONE]" {
                self.done = true;
                return;
            }
            match serde_json::from_str::<ChatChunk>(&data) {
                Ok(chunk) => self.pending.push(Ok(chunk)),
                Err(e) => {
                    // Malformed chunks degrade; they never abort the stream.
                    tracing::warn!(error = %e, "skipping malformed stream chunk");
                }
            }
        }
    }
}

impl Stream for SseStream {
    type Item = Result<ChatChunk, HavenError>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        // Return pending chunks first
        if !self.pending.is_empty() {
            return std::task::Poll::Ready(Some(self.pending.remove(0)));
        }
        if self.done {
            return std::task::Poll::Ready(None);
        }

        loop {
            match self.inner.as_mut().poll_next(cx) {
                std::task::Poll::Ready(Some(Ok(bytes))) => {
                    // Data received, reset idle timer
                    let new_deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(new_deadline);

                    let text = String::from_utf8_lossy(&bytes).into_owned();
                    self.buffer.push_str(&text);

                    // Process complete SSE frames from the buffer
                    while let Some(pos) = self.buffer.find("\n\n") {
                        let frame = self.buffer[..pos + 2].to_string();
                        self.buffer = self.buffer[pos + 2..].to_string();
                        self.ingest(&frame);
                    }

                    if !self.pending.is_empty() {
                        return std::task::Poll::Ready(Some(self.pending.remove(0)));
                    }
                    if self.done {
                        return std::task::Poll::Ready(None);
                    }
                }
                std::task::Poll::Ready(Some(Err(e))) => {
                    return std::task::Poll::Ready(Some(Err(HavenError::StreamInterrupted(
                        e.to_string(),
                    ))));
                }
                std::task::Poll::Ready(None) => {
                    // Stream ended, process remaining buffer
                    if !self.buffer.is_empty() {
                        let remaining = std::mem::take(&mut self.buffer);
                        self.ingest(&remaining);
                        if !self.pending.is_empty() {
                            return std::task::Poll::Ready(Some(self.pending.remove(0)));
                        }
                    }
                    return std::task::Poll::Ready(None);
                }
                std::task::Poll::Pending => {
                    // No data available, check idle timeout
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        return std::task::Poll::Ready(Some(Err(HavenError::StreamInterrupted(
                            format!("idle timeout after {}s", self.idle_duration.as_secs()),
                        ))));
                    }
                    return std::task::Poll::Pending;
                }
            }
        }
    }
}
