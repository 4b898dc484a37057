use crate::errors::GatewayError;
use crate::ids::ToolCallId;
use crate::messages::{ContentBlock, StopReason, ToolUse};
use crate::tokens::TokenUsage;

/// Events emitted during engine streaming. Ordering contract:
///
/// Start → (TextStart → TextDelta* → TextEnd | ThinkingStart → ThinkingDelta* → ThinkingEnd |
///          ToolCallStart → ToolCallDelta* → ToolCallEnd)* → Done
///
/// Error can appear at any point and ends the stream.
#[derive(Clone, Debug)]
pub enum StreamEvent {
    Start,

    TextStart,
    TextDelta { delta: String },
    TextEnd { text: String },

    ThinkingStart,
    ThinkingDelta { delta: String },
    ThinkingEnd { thinking: String, signature: Option<String> },

    /// `server_side` marks tools the engine runs itself (web search).
    ToolCallStart { tool_call_id: ToolCallId, name: String, server_side: bool },
    ToolCallDelta { tool_call_id: ToolCallId, arguments_delta: String },
    ToolCallEnd { tool_use: ToolUse, server_side: bool },

    /// Full assistant content in stream index order.
    Done { content: Vec<ContentBlock>, stop_reason: StopReason, usage: TokenUsage },
    Error { error: GatewayError },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}
