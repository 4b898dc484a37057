use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;

use strand_core::events::TurnEvent;
use strand_core::tools::{CustomToolSpec, Tool, ToolContext, ToolDefinition, ToolError, ToolResult};

/// Reply the engine gets once the caller has been handed a custom tool call.
pub fn rendered_message(tool: &str) -> String {
    format!("{tool} rendered successfully")
}

/// A caller-defined tool. Invocations are forwarded as `tool_call` events for
/// the caller to render; the engine only sees an acknowledgement.
pub struct RenderTool {
    spec: CustomToolSpec,
}

impl RenderTool {
    pub fn new(spec: CustomToolSpec) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Tool for RenderTool {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn definition(&self) -> ToolDefinition {
        self.spec.to_definition()
    }

    fn describe(&self, _args: &Value) -> String {
        self.spec.name.clone()
    }

    fn announce(&self, args: &Value) -> TurnEvent {
        TurnEvent::ToolCall { tool: self.spec.name.clone(), args: args.clone() }
    }

    async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let start = Instant::now();
        Ok(ToolResult::text(rendered_message(&self.spec.name), start.elapsed()))
    }
}
