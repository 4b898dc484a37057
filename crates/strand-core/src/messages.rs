use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::ToolCallId;

/// One transcript entry. The serialized form is the persisted history line and,
/// after [`crate::messages::Message::strip_cache_control`]-style cleanup, the
/// wire shape the streaming engine expects.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// A content block plus its optional cache marker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(flatten)]
    pub kind: BlockKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<CacheControl>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockKind {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    RedactedThinking {
        data: String,
    },
    ToolUse(ToolUse),
    /// Tool executed by the engine itself (web search).
    ServerToolUse(ToolUse),
    WebSearchToolResult {
        tool_use_id: String,
        content: Value,
    },
    ToolResult(ToolResultBlock),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolUse {
    pub id: ToolCallId,
    pub name: String,
    #[serde(default)]
    pub input: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResultBlock {
    pub tool_use_id: ToolCallId,
    pub content: ToolResultContent,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Blocks(Vec<InlineContent>),
}

/// Inline content a tool can hand back instead of plain text.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InlineContent {
    Text { text: String },
    Image { source: MediaSource },
    Document { source: MediaSource },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MediaSource {
    #[serde(rename = "type")]
    pub encoding: String,
    pub media_type: String,
    pub data: String,
}

impl MediaSource {
    pub fn base64(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            encoding: "base64".into(),
            media_type: media_type.into(),
            data: data.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CacheControl {
    Ephemeral,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
    PauseTurn,
    Refusal,
    #[serde(other)]
    Other,
}

// --- Convenience constructors ---

impl ContentBlock {
    pub fn new(kind: BlockKind) -> Self {
        Self { kind, cache_control: None }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(BlockKind::Text { text: text.into() })
    }

    pub fn tool_use(id: ToolCallId, name: impl Into<String>, input: Value) -> Self {
        Self::new(BlockKind::ToolUse(ToolUse { id, name: name.into(), input }))
    }

    pub fn tool_result(tool_use_id: ToolCallId, content: ToolResultContent, is_error: bool) -> Self {
        Self::new(BlockKind::ToolResult(ToolResultBlock { tool_use_id, content, is_error }))
    }
}

impl Message {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self { role: Role::User, content: MessageContent::Text(text.into()) }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: MessageContent::Text(text.into()) }
    }

    pub fn user_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self { role: Role::User, content: MessageContent::Blocks(blocks) }
    }

    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self { role: Role::Assistant, content: MessageContent::Blocks(blocks) }
    }

    pub fn blocks(&self) -> &[ContentBlock] {
        match &self.content {
            MessageContent::Blocks(blocks) => blocks,
            MessageContent::Text(_) => &[],
        }
    }

    /// Client-side tool-use requests, in order.
    pub fn tool_uses(&self) -> Vec<&ToolUse> {
        self.blocks()
            .iter()
            .filter_map(|b| match &b.kind {
                BlockKind::ToolUse(tu) => Some(tu),
                _ => None,
            })
            .collect()
    }

    pub fn tool_result_ids(&self) -> Vec<&ToolCallId> {
        self.blocks()
            .iter()
            .filter_map(|b| match &b.kind {
                BlockKind::ToolResult(tr) => Some(&tr.tool_use_id),
                _ => None,
            })
            .collect()
    }

    pub fn text_content(&self) -> String {
        match &self.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match &b.kind {
                    BlockKind::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    pub fn has_cache_control(&self) -> bool {
        self.blocks().iter().any(|b| b.cache_control.is_some())
    }

    /// Remove every cache marker. Returns how many were removed.
    pub fn strip_cache_control(&mut self) -> usize {
        let MessageContent::Blocks(blocks) = &mut self.content else {
            return 0;
        };
        blocks
            .iter_mut()
            .filter_map(|b| b.cache_control.take())
            .count()
    }

    /// Mark the final content segment as the cache boundary, promoting plain
    /// text to a single text block first. Returns false for empty content.
    pub fn mark_cache_boundary(&mut self) -> bool {
        if let MessageContent::Text(text) = &mut self.content {
            let text = std::mem::take(text);
            self.content = MessageContent::Blocks(vec![ContentBlock::text(text)]);
        }
        match &mut self.content {
            MessageContent::Blocks(blocks) => match blocks.last_mut() {
                Some(last) => {
                    last.cache_control = Some(CacheControl::Ephemeral);
                    true
                }
                None => false,
            },
            MessageContent::Text(_) => false,
        }
    }

    /// Append blocks to a user message, promoting plain text first.
    pub fn extend_blocks(&mut self, extra: Vec<ContentBlock>) {
        if let MessageContent::Text(text) = &mut self.content {
            let text = std::mem::take(text);
            self.content = MessageContent::Blocks(vec![ContentBlock::text(text)]);
        }
        if let MessageContent::Blocks(blocks) = &mut self.content {
            blocks.extend(extra);
        }
    }
}

impl ToolResultContent {
    /// Text view of the result, used for previews and step data.
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .map(|b| match b {
                    InlineContent::Text { text } => text.clone(),
                    InlineContent::Image { source } => format!("[image {}]", source.media_type),
                    InlineContent::Document { source } => {
                        format!("[document {}]", source.media_type)
                    }
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}
