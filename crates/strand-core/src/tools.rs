use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::events::TurnEvent;
use crate::ids::SessionId;
use crate::messages::ToolResultContent;

/// Context available to tools during execution.
#[derive(Clone, Debug)]
pub struct ToolContext {
    pub session_id: SessionId,
    pub workspace: PathBuf,
    pub abort_signal: CancellationToken,
}

/// Result returned by a tool execution.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolResult {
    pub content: ToolResultContent,
    pub is_error: bool,
    pub duration: Duration,
}

impl ToolResult {
    pub fn text(content: impl Into<String>, duration: Duration) -> Self {
        Self {
            content: ToolResultContent::Text(content.into()),
            is_error: false,
            duration,
        }
    }

    pub fn error(content: impl Into<String>, duration: Duration) -> Self {
        Self {
            content: ToolResultContent::Text(content.into()),
            is_error: true,
            duration,
        }
    }
}

/// How a tool is declared to the streaming engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolSchema {
    /// Engine-defined tool referenced by its versioned type, e.g. `bash_20250124`.
    Builtin { tool_type: String },
    Custom { description: String, input_schema: Value },
}

/// Tool definition sent to the engine as part of the context.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub schema: ToolSchema,
}

impl ToolDefinition {
    pub fn builtin(name: impl Into<String>, tool_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema: ToolSchema::Builtin { tool_type: tool_type.into() },
        }
    }
}

/// A caller-supplied tool whose invocations are rendered by the caller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object_schema", alias = "input_schema")]
    pub input_schema: Value,
}

fn empty_object_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

impl CustomToolSpec {
    pub fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            schema: ToolSchema::Custom {
                description: self.description.clone(),
                input_schema: self.input_schema.clone(),
            },
        }
    }
}

/// Trait implemented by each tool the streaming loop can dispatch.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn definition(&self) -> ToolDefinition;

    /// One-line description of an invocation, shown as a `step` event.
    fn describe(&self, args: &Value) -> String;

    /// Event announcing an invocation before it runs.
    fn announce(&self, args: &Value) -> TurnEvent {
        TurnEvent::step(self.describe(args))
    }

    /// Whether the output is also surfaced to the caller as `step_data`.
    fn reports_output(&self) -> bool {
        false
    }

    /// Whether invocations must be confirmed under a gating approval policy.
    fn requires_approval(&self) -> bool {
        false
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn custom_tool_accepts_both_schema_spellings() {
        let camel: CustomToolSpec = serde_json::from_value(json!({
            "name": "render_chart",
            "description": "Render a chart",
            "inputSchema": {"type": "object"}
        }))
        .unwrap();
        let snake: CustomToolSpec = serde_json::from_value(json!({
            "name": "render_chart",
            "description": "Render a chart",
            "input_schema": {"type": "object"}
        }))
        .unwrap();
        assert_eq!(camel, snake);
        assert_eq!(serde_json::to_value(&camel).unwrap()["inputSchema"]["type"], "object");
    }

    #[test]
    fn custom_tool_defaults_schema() {
        let spec: CustomToolSpec = serde_json::from_value(json!({"name": "ping"})).unwrap();
        assert_eq!(spec.input_schema["type"], "object");
        assert!(matches!(spec.to_definition().schema, ToolSchema::Custom { .. }));
    }

    #[test]
    fn tool_result_constructors() {
        let ok = ToolResult::text("fine", Duration::ZERO);
        assert!(!ok.is_error);
        let err = ToolResult::error("Error: nope", Duration::ZERO);
        assert!(err.is_error);
        assert_eq!(err.content.as_text(), "Error: nope");
    }

    #[test]
    fn tool_error_display() {
        let err = ToolError::InvalidArguments("missing command".into());
        assert_eq!(err.to_string(), "invalid arguments: missing command");
    }
}
