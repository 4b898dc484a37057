use std::path::Path;

use futures::StreamExt;
use serde::Deserialize;
use tracing::instrument;

use strand_core::context::LlmContext;
use strand_core::messages::{BlockKind, Message, MessageContent, Role};
use strand_core::provider::{LlmProvider, StreamOptions, ThinkingConfig};
use strand_core::stream::StreamEvent;

use crate::error::StoreError;
use crate::history;

pub const SUMMARY_HEADER: &str = "[Conversation summary]";
pub const SUMMARY_ACK: &str =
    "Understood. I have the summary of our conversation so far and will continue from there.";

const SUMMARIZE_INSTRUCTION: &str = "Summarize the conversation transcript above so that the \
work can continue without it. Keep the user's goals, decisions that were made, files that were \
read or changed, commands that were run with their notable results, and any open tasks. \
Reply with the summary only.";

/// Longest tool input or output quoted verbatim in the summarization transcript.
const QUOTE_LIMIT: usize = 2_000;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Accumulated input tokens above which a turn's history is compacted.
    pub threshold: u64,
    pub max_tokens: u32,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self { threshold: 150_000, max_tokens: 8_192 }
    }
}

impl CompactionConfig {
    pub fn should_compact(&self, input_tokens: u64) -> bool {
        input_tokens > self.threshold
    }
}

/// What happened to the turn's messages on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PersistOutcome {
    Appended,
    Compacted,
}

fn clip(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let head: String = text.chars().take(limit).collect();
    format!("{head}...")
}

/// Flatten a transcript into plain text. The summarization call carries no
/// tool definitions, so tool blocks cannot be replayed as structured content.
pub fn render_transcript(messages: &[Message]) -> String {
    let mut out = String::new();
    for msg in messages {
        let speaker = match msg.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
        };
        let parts: Vec<String> = match &msg.content {
            MessageContent::Text(text) => vec![text.clone()],
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match &b.kind {
                    BlockKind::Text { text } => Some(text.clone()),
                    BlockKind::ToolUse(tu) | BlockKind::ServerToolUse(tu) => {
                        Some(format!("[called {} with {}]", tu.name, clip(&tu.input.to_string(), QUOTE_LIMIT)))
                    }
                    BlockKind::ToolResult(tr) => {
                        let label = if tr.is_error { "tool error" } else { "tool result" };
                        Some(format!("[{label}: {}]", clip(&tr.content.as_text(), QUOTE_LIMIT)))
                    }
                    BlockKind::WebSearchToolResult { .. } => Some("[web search results]".into()),
                    BlockKind::Thinking { .. } | BlockKind::RedactedThinking { .. } => None,
                })
                .collect(),
        };
        if parts.is_empty() {
            continue;
        }
        out.push_str(speaker);
        out.push_str(": ");
        out.push_str(&parts.join("\n"));
        out.push_str("\n\n");
    }
    out
}

pub fn summary_pair(summary: &str) -> [Message; 2] {
    [
        Message::user_text(format!("{SUMMARY_HEADER}\n\n{}", summary.trim())),
        Message::assistant_text(SUMMARY_ACK),
    ]
}

/// Ask the engine, without tools, for a summary of `messages`.
#[instrument(skip_all, fields(messages = messages.len(), provider = provider.name()))]
pub async fn compact(
    provider: &dyn LlmProvider,
    messages: &[Message],
    config: &CompactionConfig,
) -> Result<[Message; 2], StoreError> {
    let prompt = format!("<transcript>\n{}</transcript>\n\n{SUMMARIZE_INSTRUCTION}", render_transcript(messages));
    let context = LlmContext::new(vec![Message::user_text(prompt)]);
    let options = StreamOptions {
        max_tokens: config.max_tokens,
        thinking: ThinkingConfig::Disabled,
        stop_sequences: Vec::new(),
    };

    let mut stream = provider
        .stream(&context, &options)
        .await
        .map_err(|e| StoreError::Compaction(e.to_string()))?;

    let mut streamed = String::new();
    let mut summary = None;
    while let Some(event) = stream.next().await {
        match event {
            StreamEvent::TextDelta { delta } => streamed.push_str(&delta),
            StreamEvent::Done { content, .. } => {
                let text = Message::assistant_blocks(content).text_content();
                summary = Some(if text.is_empty() { std::mem::take(&mut streamed) } else { text });
                break;
            }
            StreamEvent::Error { error } => return Err(StoreError::Compaction(error.to_string())),
            _ => {}
        }
    }

    match summary {
        Some(text) if !text.trim().is_empty() => Ok(summary_pair(&text)),
        Some(_) => Err(StoreError::Compaction("engine returned an empty summary".into())),
        None => Err(StoreError::Compaction("stream ended before completion".into())),
    }
}

/// Write a finished turn. Over the threshold the whole transcript is replaced
/// by a summary pair; if that fails for any reason only `new_messages` are
/// appended and the prior history stays as it was.
#[instrument(skip_all, fields(path = %path.display(), input_tokens = input_tokens))]
pub async fn persist_turn(
    path: &Path,
    prior: &[Message],
    new_messages: &[Message],
    input_tokens: u64,
    config: &CompactionConfig,
    provider: &dyn LlmProvider,
) -> Result<PersistOutcome, StoreError> {
    if config.should_compact(input_tokens) {
        let full: Vec<Message> = prior.iter().chain(new_messages).cloned().collect();
        let compacted = match compact(provider, &full, config).await {
            Ok(pair) => history::overwrite(path, &pair).await,
            Err(e) => Err(e),
        };
        match compacted {
            Ok(()) => {
                tracing::info!(replaced = full.len(), "history compacted");
                return Ok(PersistOutcome::Compacted);
            }
            Err(e) => tracing::warn!(error = %e, "compaction failed, appending turn instead"),
        }
    }
    history::append(path, new_messages).await?;
    Ok(PersistOutcome::Appended)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strand_core::errors::GatewayError;
    use strand_core::ids::ToolCallId;
    use strand_core::messages::{ContentBlock, ToolResultContent};
    use strand_llm::mock::{MockProvider, MockResponse, MockTurn};

    fn prior() -> Vec<Message> {
        vec![Message::user_text("hello"), Message::assistant_text("hi there")]
    }

    fn turn() -> Vec<Message> {
        let id = ToolCallId::from_raw("toolu_1");
        vec![
            Message::user_text("list files"),
            Message::assistant_blocks(vec![ContentBlock::tool_use(id.clone(), "bash", json!({"command": "ls"}))]),
            Message::user_blocks(vec![ContentBlock::tool_result(id, ToolResultContent::Text("a.txt".into()), false)]),
            Message::assistant_text("One file."),
        ]
    }

    async fn seeded(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join(".strand/history_s.jsonl");
        history::append(&path, &prior()).await.unwrap();
        path
    }

    #[test]
    fn transcript_rendering() {
        let text = render_transcript(&turn());
        assert!(text.starts_with("User: list files\n\n"));
        assert!(text.contains(r#"[called bash with {"command":"ls"}]"#));
        assert!(text.contains("[tool result: a.txt]"));
        assert!(text.ends_with("Assistant: One file.\n\n"));
    }

    #[test]
    fn threshold_is_strict() {
        let config = CompactionConfig::default();
        assert!(!config.should_compact(150_000));
        assert!(config.should_compact(150_001));
    }

    #[tokio::test]
    async fn compact_produces_summary_pair_without_tools() {
        let mock = MockProvider::new(vec![MockResponse::text("User listed files; one file a.txt.")]);
        let pair = compact(&mock, &turn(), &CompactionConfig::default()).await.unwrap();
        assert_eq!(pair[0].text_content(), "[Conversation summary]\n\nUser listed files; one file a.txt.");
        assert_eq!(pair[1].text_content(), SUMMARY_ACK);

        let request = &mock.requests()[0];
        assert!(request.tools.is_empty());
        assert_eq!(request.messages.len(), 1);
        assert!(request.messages[0].text_content().contains("list files"));
    }

    #[tokio::test]
    async fn over_threshold_replaces_history_with_pair() {
        let dir = tempfile::tempdir().unwrap();
        let path = seeded(&dir).await;
        let mock = MockProvider::new(vec![MockResponse::text("summary text")]);

        let outcome = persist_turn(&path, &prior(), &turn(), 200_000, &CompactionConfig::default(), &mock)
            .await
            .unwrap();
        assert_eq!(outcome, PersistOutcome::Compacted);

        let loaded = history::load(&path).await;
        assert_eq!(loaded.len(), 2);
        assert!(loaded[0].text_content().starts_with(SUMMARY_HEADER));
        assert_eq!(loaded[1].text_content(), SUMMARY_ACK);
    }

    #[tokio::test]
    async fn failed_compaction_appends_turn_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = seeded(&dir).await;
        let mock = MockProvider::new(vec![MockResponse::stream_error(GatewayError::ProviderOverloaded)]);

        let outcome = persist_turn(&path, &prior(), &turn(), 200_000, &CompactionConfig::default(), &mock)
            .await
            .unwrap();
        assert_eq!(outcome, PersistOutcome::Appended);

        let mut loaded = history::load(&path).await;
        for m in &mut loaded {
            m.strip_cache_control();
        }
        let mut expected: Vec<Message> = prior().into_iter().chain(turn()).collect();
        // Plain-text content is promoted to a block by the load-time marker.
        expected.last_mut().unwrap().mark_cache_boundary();
        expected.last_mut().unwrap().strip_cache_control();
        assert_eq!(loaded, expected);
    }

    #[tokio::test]
    async fn empty_summary_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = seeded(&dir).await;
        let mock = MockProvider::new(vec![MockTurn::new().text("   ").build()]);

        let outcome = persist_turn(&path, &prior(), &turn(), 200_000, &CompactionConfig::default(), &mock)
            .await
            .unwrap();
        assert_eq!(outcome, PersistOutcome::Appended);
        assert_eq!(history::load(&path).await.len(), 6);
    }

    #[tokio::test]
    async fn under_threshold_appends_without_calling_engine() {
        let dir = tempfile::tempdir().unwrap();
        let path = seeded(&dir).await;
        let mock = MockProvider::new(Vec::new());

        let outcome = persist_turn(&path, &prior(), &turn(), 10, &CompactionConfig::default(), &mock)
            .await
            .unwrap();
        assert_eq!(outcome, PersistOutcome::Appended);
        assert_eq!(mock.call_count(), 0);
        assert_eq!(history::load(&path).await.len(), 6);
    }
}
