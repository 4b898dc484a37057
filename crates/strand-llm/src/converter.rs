use serde_json::{json, Value};

use strand_core::context::LlmContext;
use strand_core::messages::{BlockKind, ContentBlock, Message, MessageContent};
use strand_core::provider::{StreamOptions, ThinkingConfig};
use strand_core::tools::{ToolDefinition, ToolSchema};

/// Smallest thinking budget the Messages API accepts.
const MIN_THINKING_BUDGET: u32 = 1024;

/// Convert a full LlmContext into the Anthropic API request body.
pub fn build_request_body(context: &LlmContext, options: &StreamOptions, model: &str) -> Value {
    let mut body = json!({
        "model": model,
        "stream": true,
        "max_tokens": options.max_tokens,
    });

    if !options.stop_sequences.is_empty() {
        body["stop_sequences"] = json!(options.stop_sequences);
    }

    match &options.thinking {
        ThinkingConfig::Disabled => {}
        ThinkingConfig::Budget { tokens } => {
            // budget_tokens must stay below max_tokens
            let budget = (*tokens).min(options.max_tokens.saturating_sub(1));
            if budget >= MIN_THINKING_BUDGET {
                body["thinking"] = json!({"type": "enabled", "budget_tokens": budget});
            }
        }
    }

    if let Some(system) = &context.system {
        body["system"] = json!([{
            "type": "text",
            "text": system,
            "cache_control": {"type": "ephemeral"},
        }]);
    }

    body["messages"] = json!(convert_messages(&context.messages));

    if !context.tools.is_empty() {
        let mut tools: Vec<Value> = context.tools.iter().map(convert_tool).collect();
        if let Some(last) = tools.last_mut() {
            last["cache_control"] = json!({"type": "ephemeral"});
        }
        body["tools"] = json!(tools);
    }

    body
}

fn convert_tool(tool: &ToolDefinition) -> Value {
    match &tool.schema {
        ToolSchema::Builtin { tool_type } => json!({
            "type": tool_type,
            "name": tool.name,
        }),
        ToolSchema::Custom { description, input_schema } => json!({
            "type": "custom",
            "name": tool.name,
            "description": description,
            "input_schema": input_schema,
        }),
    }
}

/// Serialize transcript messages for the wire. Thinking blocks without a
/// signature cannot be replayed and are dropped; a message left with no
/// blocks is dropped with them.
fn convert_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .filter_map(|msg| match &msg.content {
            MessageContent::Text(_) => serde_json::to_value(msg).ok(),
            MessageContent::Blocks(blocks) => {
                let kept: Vec<&ContentBlock> = blocks.iter().filter(|b| replayable(b)).collect();
                if kept.is_empty() {
                    return None;
                }
                Some(json!({"role": msg.role, "content": kept}))
            }
        })
        .collect()
}

fn replayable(block: &ContentBlock) -> bool {
    match &block.kind {
        BlockKind::Thinking { signature, .. } => signature.as_deref().is_some_and(|s| !s.is_empty()),
        _ => true,
    }
}
