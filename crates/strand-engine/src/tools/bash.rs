use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;

use strand_core::tools::{Tool, ToolContext, ToolDefinition, ToolError, ToolResult};

use crate::sandbox::Sandbox;
use crate::truncate::prefix_chars;

pub const BASH_TOOL_NAME: &str = "bash";
const BASH_TOOL_TYPE: &str = "bash_20250124";
/// Characters of the command shown in the step label.
const LABEL_CHARS: usize = 60;

pub struct BashTool {
    sandbox: Sandbox,
}

impl BashTool {
    pub fn new(sandbox: Sandbox) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        BASH_TOOL_NAME
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::builtin(BASH_TOOL_NAME, BASH_TOOL_TYPE)
    }

    fn describe(&self, args: &Value) -> String {
        let command = args["command"].as_str().unwrap_or_default();
        format!("Bash({})", prefix_chars(command, LABEL_CHARS))
    }

    fn reports_output(&self) -> bool {
        true
    }

    fn requires_approval(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let start = Instant::now();
        let command = args["command"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("command is required".into()))?;

        let output = self.sandbox.exec_bash(command, &ctx.workspace, &ctx.abort_signal).await;
        Ok(ToolResult::text(output, start.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strand_core::ids::SessionId;
    use tokio_util::sync::CancellationToken;

    use crate::config::SandboxConfig;

    fn ctx(dir: &tempfile::TempDir) -> ToolContext {
        ToolContext {
            session_id: SessionId::new(),
            workspace: dir.path().to_path_buf(),
            abort_signal: CancellationToken::new(),
        }
    }

    #[test]
    fn describe_truncates_command() {
        let tool = BashTool::new(Sandbox::new(SandboxConfig::unconfined()));
        assert_eq!(tool.describe(&json!({"command": "ls"})), "Bash(ls)");
        let long = "x".repeat(100);
        assert_eq!(tool.describe(&json!({"command": long})), format!("Bash({})", "x".repeat(60)));
    }

    #[tokio::test]
    async fn runs_command_in_workspace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.md"), "").unwrap();
        let tool = BashTool::new(Sandbox::new(SandboxConfig::unconfined()));
        let result = tool.execute(json!({"command": "ls"}), &ctx(&dir)).await.unwrap();
        assert_eq!(result.content.as_text(), "notes.md");
        assert!(!result.is_error);
    }

    #[tokio::test]
    async fn missing_command_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let tool = BashTool::new(Sandbox::new(SandboxConfig::unconfined()));
        let err = tool.execute(json!({}), &ctx(&dir)).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }
}
