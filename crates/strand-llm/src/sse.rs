use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use strand_core::errors::GatewayError;
use strand_core::ids::ToolCallId;
use strand_core::messages::{BlockKind, ContentBlock, StopReason, ToolUse};
use strand_core::stream::StreamEvent;
use strand_core::tokens::TokenUsage;

/// State machine for parsing Anthropic SSE stream events.
///
/// Blocks are keyed by their stream index so the final content keeps the
/// order the engine produced, whatever the interleaving of block kinds.
#[derive(Default)]
pub struct SseParser {
    blocks: BTreeMap<usize, BlockState>,
    current: Option<usize>,
    usage: TokenUsage,
    stop_reason: Option<StopReason>,
}

enum BlockState {
    Text { text: String },
    Thinking { thinking: String, signature: Option<String> },
    RedactedThinking { data: String },
    ToolUse { id: String, name: String, initial: Value, json: String, server_side: bool },
    WebSearchResult { tool_use_id: String, content: Value },
}

impl BlockState {
    fn tool_use(id: &str, name: &str, initial: &Value, json: &str) -> ToolUse {
        let input = if json.trim().is_empty() {
            match initial {
                Value::Object(_) => initial.clone(),
                _ => Value::Object(serde_json::Map::new()),
            }
        } else {
            serde_json::from_str(json).unwrap_or(Value::Object(serde_json::Map::new()))
        };
        ToolUse { id: ToolCallId::from_raw(id), name: name.to_string(), input }
    }

    fn to_block(&self) -> ContentBlock {
        let kind = match self {
            Self::Text { text } => BlockKind::Text { text: text.clone() },
            Self::Thinking { thinking, signature } => BlockKind::Thinking {
                thinking: thinking.clone(),
                signature: signature.clone(),
            },
            Self::RedactedThinking { data } => BlockKind::RedactedThinking { data: data.clone() },
            Self::ToolUse { id, name, initial, json, server_side } => {
                let tool_use = Self::tool_use(id, name, initial, json);
                if *server_side {
                    BlockKind::ServerToolUse(tool_use)
                } else {
                    BlockKind::ToolUse(tool_use)
                }
            }
            Self::WebSearchResult { tool_use_id, content } => BlockKind::WebSearchToolResult {
                tool_use_id: tool_use_id.clone(),
                content: content.clone(),
            },
        };
        ContentBlock::new(kind)
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or("")
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a single SSE event and return zero or more StreamEvents.
    pub fn parse_event(&mut self, event_type: &str, data: &str) -> Vec<StreamEvent> {
        let mut events = Vec::new();

        match event_type {
            "message_start" => {
                if let Ok(msg) = serde_json::from_str::<MessageStartEvent>(data) {
                    if let Some(usage) = msg.message.usage {
                        self.usage.input_tokens = usage.input_tokens.unwrap_or(0);
                        self.usage.cache_read_tokens = usage.cache_read_input_tokens.unwrap_or(0);
                        self.usage.cache_creation_tokens =
                            usage.cache_creation_input_tokens.unwrap_or(0);
                        self.usage.output_tokens = usage.output_tokens.unwrap_or(0);
                    }
                }
                events.push(StreamEvent::Start);
            }

            "content_block_start" => {
                let Ok(start) = serde_json::from_str::<ContentBlockStartEvent>(data) else {
                    return events;
                };
                let block = &start.content_block;
                let state = match str_field(block, "type") {
                    "text" => {
                        events.push(StreamEvent::TextStart);
                        BlockState::Text { text: str_field(block, "text").to_string() }
                    }
                    "thinking" => {
                        events.push(StreamEvent::ThinkingStart);
                        BlockState::Thinking {
                            thinking: str_field(block, "thinking").to_string(),
                            signature: None,
                        }
                    }
                    "redacted_thinking" => BlockState::RedactedThinking {
                        data: str_field(block, "data").to_string(),
                    },
                    kind @ ("tool_use" | "server_tool_use") => {
                        let id = str_field(block, "id").to_string();
                        let name = str_field(block, "name").to_string();
                        let server_side = kind == "server_tool_use";
                        events.push(StreamEvent::ToolCallStart {
                            tool_call_id: ToolCallId::from_raw(&id),
                            name: name.clone(),
                            server_side,
                        });
                        BlockState::ToolUse {
                            id,
                            name,
                            initial: block.get("input").cloned().unwrap_or(Value::Null),
                            json: String::new(),
                            server_side,
                        }
                    }
                    "web_search_tool_result" => BlockState::WebSearchResult {
                        tool_use_id: str_field(block, "tool_use_id").to_string(),
                        content: block.get("content").cloned().unwrap_or(Value::Null),
                    },
                    other => {
                        tracing::debug!(block_type = other, "ignoring unknown content block");
                        return events;
                    }
                };
                self.blocks.insert(start.index, state);
                self.current = Some(start.index);
            }

            "content_block_delta" => {
                let Ok(delta) = serde_json::from_str::<ContentBlockDeltaEvent>(data) else {
                    return events;
                };
                let index = delta.index.or(self.current);
                let Some(state) = index.and_then(|i| self.blocks.get_mut(&i)) else {
                    return events;
                };
                let d = &delta.delta;
                match (str_field(d, "type"), state) {
                    ("text_delta", BlockState::Text { text }) => {
                        let chunk = str_field(d, "text");
                        text.push_str(chunk);
                        events.push(StreamEvent::TextDelta { delta: chunk.to_string() });
                    }
                    ("thinking_delta", BlockState::Thinking { thinking, .. }) => {
                        let chunk = str_field(d, "thinking");
                        thinking.push_str(chunk);
                        events.push(StreamEvent::ThinkingDelta { delta: chunk.to_string() });
                    }
                    ("signature_delta", BlockState::Thinking { signature, .. }) => {
                        let sig = str_field(d, "signature");
                        signature.get_or_insert_with(String::new).push_str(sig);
                    }
                    ("input_json_delta", BlockState::ToolUse { id, json, .. }) => {
                        let partial = str_field(d, "partial_json");
                        json.push_str(partial);
                        events.push(StreamEvent::ToolCallDelta {
                            tool_call_id: ToolCallId::from_raw(id.as_str()),
                            arguments_delta: partial.to_string(),
                        });
                    }
                    _ => {}
                }
            }

            "content_block_stop" => {
                let index = serde_json::from_str::<ContentBlockStopEvent>(data)
                    .ok()
                    .and_then(|s| s.index)
                    .or(self.current);
                match index.and_then(|i| self.blocks.get(&i)) {
                    Some(BlockState::Text { text }) => {
                        events.push(StreamEvent::TextEnd { text: text.clone() });
                    }
                    Some(BlockState::Thinking { thinking, signature }) => {
                        events.push(StreamEvent::ThinkingEnd {
                            thinking: thinking.clone(),
                            signature: signature.clone(),
                        });
                    }
                    Some(BlockState::ToolUse { id, name, initial, json, server_side }) => {
                        events.push(StreamEvent::ToolCallEnd {
                            tool_use: BlockState::tool_use(id, name, initial, json),
                            server_side: *server_side,
                        });
                    }
                    _ => {}
                }
                self.current = None;
            }

            "message_delta" => {
                if let Ok(delta) = serde_json::from_str::<MessageDeltaEvent>(data) {
                    if let Some(usage) = delta.usage {
                        if let Some(output) = usage.output_tokens {
                            self.usage.output_tokens = output;
                        }
                    }
                    if let Some(reason) = delta.delta.and_then(|d| d.stop_reason) {
                        self.stop_reason = Some(reason);
                    }
                }
            }

            "message_stop" => {
                let content = self.content();
                let stop_reason = self.stop_reason.clone().unwrap_or_else(|| {
                    if content.iter().any(|b| matches!(b.kind, BlockKind::ToolUse(_))) {
                        StopReason::ToolUse
                    } else {
                        StopReason::EndTurn
                    }
                });
                events.push(StreamEvent::Done {
                    content,
                    stop_reason,
                    usage: self.usage.clone(),
                });
            }

            "error" => {
                if let Ok(err) = serde_json::from_str::<ErrorEvent>(data) {
                    events.push(StreamEvent::Error {
                        error: GatewayError::from_api_error(&err.error.error_type, err.error.message),
                    });
                }
            }

            _ => {} // ping, etc.
        }

        events
    }

    /// Extract accumulated token usage.
    pub fn token_usage(&self) -> TokenUsage {
        self.usage.clone()
    }

    fn content(&self) -> Vec<ContentBlock> {
        self.blocks.values().map(BlockState::to_block).collect()
    }
}

/// Parse raw SSE text into (event_type, data) pairs. Multi-line `data:`
/// fields are joined with newlines.
pub fn parse_sse_lines(raw: &str) -> Vec<(String, String)> {
    let mut events = Vec::new();
    let mut current_event = String::new();
    let mut current_data: Vec<&str> = Vec::new();

    for line in raw.lines() {
        if let Some(event) = line.strip_prefix("event:") {
            current_event = event.trim_start().to_string();
        } else if let Some(data) = line.strip_prefix("data:") {
            current_data.push(data.strip_prefix(' ').unwrap_or(data));
        } else if line.is_empty() && !current_event.is_empty() {
            events.push((std::mem::take(&mut current_event), current_data.join("\n")));
            current_data.clear();
        }
    }

    // Handle trailing event without blank line
    if !current_event.is_empty() {
        events.push((current_event, current_data.join("\n")));
    }

    events
}

// --- Deserialization types for Anthropic SSE events ---

#[derive(Deserialize)]
struct MessageStartEvent {
    message: MessageStartPayload,
}

#[derive(Deserialize)]
struct MessageStartPayload {
    usage: Option<UsagePayload>,
}

#[derive(Deserialize)]
struct UsagePayload {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
    cache_read_input_tokens: Option<u64>,
    cache_creation_input_tokens: Option<u64>,
}

#[derive(Deserialize)]
struct ContentBlockStartEvent {
    index: usize,
    content_block: Value,
}

#[derive(Deserialize)]
struct ContentBlockDeltaEvent {
    index: Option<usize>,
    delta: Value,
}

#[derive(Deserialize)]
struct ContentBlockStopEvent {
    index: Option<usize>,
}

#[derive(Deserialize)]
struct MessageDeltaEvent {
    delta: Option<MessageDeltaPayload>,
    usage: Option<UsagePayload>,
}

#[derive(Deserialize)]
struct MessageDeltaPayload {
    stop_reason: Option<StopReason>,
}

#[derive(Deserialize)]
struct ErrorEvent {
    error: ErrorPayload,
}

#[derive(Deserialize)]
struct ErrorPayload {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}
