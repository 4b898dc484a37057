use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Future, Stream};
use reqwest::Client;
use serde::Deserialize;
use tracing::instrument;

use strand_core::context::LlmContext;
use strand_core::errors::GatewayError;
use strand_core::provider::{EventStream, LlmProvider, StreamOptions};
use strand_core::security::ApiKey;
use strand_core::stream::StreamEvent;

use crate::converter;
use crate::sse::{self, SseParser};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const API_VERSION: &str = "2023-06-01";

/// Connection settings for the Messages API.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub api_key: ApiKey,
    pub base_url: String,
    pub model: String,
    /// Seconds allowed to establish the HTTP connection.
    pub connect_timeout: u64,
    /// Seconds without any SSE data before the stream is abandoned.
    pub idle_timeout: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: ApiKey::new(""),
            base_url: DEFAULT_BASE_URL.into(),
            model: DEFAULT_MODEL.into(),
            connect_timeout: 30,
            idle_timeout: 90,
        }
    }
}

impl ProviderConfig {
    /// Defaults overlaid with `ANTHROPIC_API_KEY` and `ANTHROPIC_BASE_URL`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            config.api_key = ApiKey::new(key);
        }
        if let Ok(url) = std::env::var("ANTHROPIC_BASE_URL") {
            if !url.trim().is_empty() {
                config.base_url = url;
            }
        }
        config
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.base_url.trim_end_matches('/'))
    }
}

pub struct AnthropicProvider {
    client: Client,
    config: ProviderConfig,
}

impl AnthropicProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout))
            .build()
            .map_err(|e| GatewayError::NetworkError(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Same provider against another model.
    pub fn with_model(&self, model: impl Into<String>) -> Self {
        let mut config = self.config.clone();
        config.model = model.into();
        Self { client: self.client.clone(), config }
    }

    fn build_request(&self, context: &LlmContext, options: &StreamOptions) -> reqwest::RequestBuilder {
        let body = converter::build_request_body(context, options, &self.config.model);

        self.client
            .post(self.config.messages_url())
            .header("x-api-key", self.config.api_key.expose())
            .header("anthropic-version", API_VERSION)
            .header("accept", "application/json")
            .header("content-type", "application/json")
            .json(&body)
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    #[instrument(skip(self, context, options), fields(model = %self.config.model))]
    async fn stream(
        &self,
        context: &LlmContext,
        options: &StreamOptions,
    ) -> Result<EventStream, GatewayError> {
        if self.config.api_key.is_empty() {
            return Err(GatewayError::AuthenticationFailed("no API key configured".into()));
        }

        let resp = self
            .build_request(context, options)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout(Duration::from_secs(self.config.connect_timeout))
                } else {
                    GatewayError::NetworkError(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = resp.text().await.unwrap_or_default();
            tracing::warn!(status, "streaming request rejected");
            return Err(match GatewayError::from_status(status, body) {
                GatewayError::RateLimited { .. } => GatewayError::RateLimited { retry_after },
                other => other,
            });
        }

        let stream = SseStream::with_idle_timeout(
            resp.bytes_stream(),
            Duration::from_secs(self.config.idle_timeout),
        );
        Ok(Box::pin(stream))
    }
}

/// Wraps a byte stream from reqwest and yields StreamEvents.
/// Includes an idle timeout: if no data arrives within `idle_duration`, emits an error.
struct SseStream {
    inner: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
    parser: SseParser,
    buffer: Vec<u8>,
    pending: std::collections::VecDeque<StreamEvent>,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
    finished: bool,
}

impl SseStream {
    fn with_idle_timeout(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            parser: SseParser::new(),
            buffer: Vec::new(),
            pending: std::collections::VecDeque::new(),
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
            finished: false,
        }
    }

    fn feed_bytes(&mut self, frame: &[u8]) {
        let text = String::from_utf8_lossy(frame).replace("\r\n", "\n");
        self.feed(&text);
    }

    fn feed(&mut self, chunk: &str) {
        for (event_type, data) in sse::parse_sse_lines(chunk) {
            let events = self.parser.parse_event(&event_type, &data);
            self.pending.extend(events);
        }
    }

    /// Next queued event; a terminal event ends the stream.
    fn pop(&mut self) -> Option<StreamEvent> {
        let event = self.pending.pop_front()?;
        if event.is_terminal() {
            self.finished = true;
            self.pending.clear();
        }
        Some(event)
    }
}

/// Byte offset just past the first blank line in `buf`.
fn frame_end(buf: &[u8]) -> Option<usize> {
    let mut from = 0;
    while let Some(offset) = buf[from..].iter().position(|&b| b == b'\n') {
        let newline = from + offset;
        let rest = &buf[newline + 1..];
        if rest.first() == Some(&b'\n') {
            return Some(newline + 2);
        }
        if rest.starts_with(b"\r\n") {
            return Some(newline + 3);
        }
        from = newline + 1;
    }
    None
}

impl Stream for SseStream {
    type Item = StreamEvent;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        if let Some(event) = self.pop() {
            return std::task::Poll::Ready(Some(event));
        }
        if self.finished {
            return std::task::Poll::Ready(None);
        }

        loop {
            match self.inner.as_mut().poll_next(cx) {
                std::task::Poll::Ready(Some(Ok(bytes))) => {
                    // Data received, reset idle timer
                    let new_deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(new_deadline);

                    // Frames end on a newline, so decoding whole frames never splits a character.
                    self.buffer.extend_from_slice(&bytes);
                    while let Some(end) = frame_end(&self.buffer) {
                        let frame: Vec<u8> = self.buffer.drain(..end).collect();
                        self.feed_bytes(&frame);
                    }

                    if let Some(event) = self.pop() {
                        return std::task::Poll::Ready(Some(event));
                    }
                }
                std::task::Poll::Ready(Some(Err(e))) => {
                    self.finished = true;
                    return std::task::Poll::Ready(Some(StreamEvent::Error {
                        error: GatewayError::StreamInterrupted(e.to_string()),
                    }));
                }
                std::task::Poll::Ready(None) => {
                    if !self.buffer.is_empty() {
                        let remaining = std::mem::take(&mut self.buffer);
                        self.feed_bytes(&remaining);
                    }
                    let event = self.pop();
                    self.finished = true;
                    return std::task::Poll::Ready(event);
                }
                std::task::Poll::Pending => {
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        self.finished = true;
                        return std::task::Poll::Ready(Some(StreamEvent::Error {
                            error: GatewayError::StreamInterrupted(format!(
                                "idle timeout after {}s",
                                self.idle_duration.as_secs()
                            )),
                        }));
                    }
                    return std::task::Poll::Pending;
                }
            }
        }
    }
}
