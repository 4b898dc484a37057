use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use serde_json::Value;

use strand_core::context::LlmContext;
use strand_core::errors::GatewayError;
use strand_core::ids::ToolCallId;
use strand_core::messages::{BlockKind, ContentBlock, StopReason, ToolUse};
use strand_core::provider::{EventStream, LlmProvider, StreamOptions};
use strand_core::stream::StreamEvent;
use strand_core::tokens::TokenUsage;

/// Pre-programmed responses for deterministic testing without API calls.
pub enum MockResponse {
    /// Yield a sequence of StreamEvents.
    Stream(Vec<StreamEvent>),
    /// Return an error from the stream() call itself.
    Error(GatewayError),
    /// Wait a duration, then yield the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    /// A complete text-only response.
    pub fn text(text: &str) -> Self {
        MockTurn::new().text(text).build()
    }

    /// A response that requests one client tool call.
    pub fn tool_use(id: &str, name: &str, input: Value) -> Self {
        MockTurn::new().tool_use(id, name, input).build()
    }

    /// A stream that ends with an error event.
    pub fn stream_error(error: GatewayError) -> Self {
        Self::Stream(vec![StreamEvent::Start, StreamEvent::Error { error }])
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Builder for a scripted generation call: blocks stream in the order added.
#[derive(Default)]
pub struct MockTurn {
    events: Vec<StreamEvent>,
    content: Vec<ContentBlock>,
    usage: TokenUsage,
    stop_reason: Option<StopReason>,
}

impl MockTurn {
    pub fn new() -> Self {
        Self { events: vec![StreamEvent::Start], ..Default::default() }
    }

    pub fn text(mut self, text: &str) -> Self {
        self.events.push(StreamEvent::TextStart);
        self.events.push(StreamEvent::TextDelta { delta: text.to_string() });
        self.events.push(StreamEvent::TextEnd { text: text.to_string() });
        self.content.push(ContentBlock::text(text));
        self
    }

    pub fn thinking(mut self, thinking: &str) -> Self {
        self.events.push(StreamEvent::ThinkingStart);
        self.events.push(StreamEvent::ThinkingDelta { delta: thinking.to_string() });
        self.events.push(StreamEvent::ThinkingEnd {
            thinking: thinking.to_string(),
            signature: Some("sig_mock".into()),
        });
        self.content.push(ContentBlock::new(BlockKind::Thinking {
            thinking: thinking.to_string(),
            signature: Some("sig_mock".into()),
        }));
        self
    }

    pub fn tool_use(self, id: &str, name: &str, input: Value) -> Self {
        self.push_tool(id, name, input, false)
    }

    pub fn server_tool_use(self, id: &str, name: &str, input: Value) -> Self {
        self.push_tool(id, name, input, true)
    }

    fn push_tool(mut self, id: &str, name: &str, input: Value, server_side: bool) -> Self {
        let tool_use = ToolUse { id: ToolCallId::from_raw(id), name: name.to_string(), input };
        self.events.push(StreamEvent::ToolCallStart {
            tool_call_id: tool_use.id.clone(),
            name: name.to_string(),
            server_side,
        });
        self.events.push(StreamEvent::ToolCallDelta {
            tool_call_id: tool_use.id.clone(),
            arguments_delta: tool_use.input.to_string(),
        });
        self.events.push(StreamEvent::ToolCallEnd { tool_use: tool_use.clone(), server_side });
        self.content.push(ContentBlock::new(if server_side {
            BlockKind::ServerToolUse(tool_use)
        } else {
            BlockKind::ToolUse(tool_use)
        }));
        self
    }

    pub fn usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.usage.input_tokens = input_tokens;
        self.usage.output_tokens = output_tokens;
        self
    }

    pub fn stop_reason(mut self, stop_reason: StopReason) -> Self {
        self.stop_reason = Some(stop_reason);
        self
    }

    pub fn build(mut self) -> MockResponse {
        let stop_reason = self.stop_reason.unwrap_or_else(|| {
            if self.content.iter().any(|b| matches!(b.kind, BlockKind::ToolUse(_))) {
                StopReason::ToolUse
            } else {
                StopReason::EndTurn
            }
        });
        self.events.push(StreamEvent::Done {
            content: self.content,
            stop_reason,
            usage: self.usage,
        });
        MockResponse::Stream(self.events)
    }
}

/// Mock provider that returns pre-programmed responses in sequence and
/// records every context it was called with.
pub struct MockProvider {
    responses: Mutex<VecDeque<MockResponse>>,
    requests: Mutex<Vec<LlmContext>>,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Contexts passed to `stream`, in call order.
    pub fn requests(&self) -> Vec<LlmContext> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    async fn stream(
        &self,
        context: &LlmContext,
        _options: &StreamOptions,
    ) -> Result<EventStream, GatewayError> {
        let idx = {
            let mut requests = self.requests.lock();
            requests.push(context.clone());
            requests.len() - 1
        };
        let response = self.responses.lock().pop_front();
        match response {
            Some(response) => resolve_response(response).await,
            None => Err(GatewayError::InvalidRequest(format!(
                "MockProvider: no response configured for call {idx}"
            ))),
        }
    }
}

/// Resolve a MockResponse, handling Delay by sleeping first.
/// Unrolls nested delays iteratively to avoid recursive async.
async fn resolve_response(response: MockResponse) -> Result<EventStream, GatewayError> {
    let mut current = response;
    loop {
        match current {
            MockResponse::Stream(events) => return Ok(Box::pin(stream::iter(events))),
            MockResponse::Error(e) => return Err(e),
            MockResponse::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                current = *inner;
            }
        }
    }
}
