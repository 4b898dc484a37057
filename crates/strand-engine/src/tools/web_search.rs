use async_trait::async_trait;
use serde_json::Value;

use strand_core::tools::{Tool, ToolContext, ToolDefinition, ToolError, ToolResult};

pub const WEB_SEARCH_TOOL_NAME: &str = "web_search";
const WEB_SEARCH_TOOL_TYPE: &str = "web_search_20250305";

/// Step label for a search, with or without a query.
pub fn search_label(input: &Value) -> String {
    match input["query"].as_str().filter(|q| !q.is_empty()) {
        Some(query) => format!("Web Search(\"{query}\")"),
        None => "Web Search".to_string(),
    }
}

/// Declares the engine's own search capability. Searches run server-side and
/// are never dispatched locally.
pub struct WebSearchTool;

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        WEB_SEARCH_TOOL_NAME
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::builtin(WEB_SEARCH_TOOL_NAME, WEB_SEARCH_TOOL_TYPE)
    }

    fn describe(&self, args: &Value) -> String {
        search_label(args)
    }

    async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        Err(ToolError::ExecutionFailed("web_search is executed by the engine".into()))
    }
}
