//! Mapping from subprocess engine notifications to [`TurnEvent`]s.
//!
//! Method names and item types are closed enums; anything the engine adds
//! later parses into an `Unrecognized` variant and produces no events.

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use strand_core::events::TurnEvent;
use strand_core::tokens::UsageReport;

use crate::truncate::prefix_chars;

const COMMAND_LABEL_CHARS: usize = 60;
const TOOL_LABEL_CHARS: usize = 40;

/// Per-turn state the translator threads through notifications.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TurnState {
    /// Thread id reported by `thread/started`.
    pub thread: Option<String>,
    /// A step was emitted this turn; reasoning is suppressed from then on.
    pub stepped: bool,
    /// Reasoning summary text buffered until the reasoning item completes.
    pub think: String,
    pub done: bool,
    /// An approval request was declined and is awaiting the user.
    pub approval: bool,
    pub usage: Option<UsageReport>,
    pub turn_diff: String,
}

impl TurnState {
    /// The turn is finished or waiting on the user.
    pub fn should_stop(&self) -> bool {
        self.done || self.approval
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct PlanStep {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

impl PlanStep {
    fn display(&self) -> Option<String> {
        let label = [&self.label, &self.title]
            .into_iter()
            .flatten()
            .find(|s| !s.is_empty())?;
        let mark = if self.status.as_deref() == Some("completed") { "[x]" } else { "[ ]" };
        Some(format!("{mark} {label}"))
    }
}

/// Notifications the subprocess engine sends during a turn.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerNotification {
    AgentMessageDelta { delta: String },
    CommandOutputDelta { delta: String },
    ReasoningSummaryDelta { delta: String },
    ItemStarted(ItemKind),
    ItemCompleted(ItemKind),
    TurnDiffUpdated { diff: String },
    TurnPlanUpdated { steps: Vec<PlanStep> },
    TurnCompleted,
    TokenUsageUpdated(Box<UsageReport>),
    ThreadStarted { thread_id: Option<String> },
    Unrecognized { method: String },
}

fn str_field(params: &Value, key: &str) -> String {
    params[key].as_str().unwrap_or_default().to_string()
}

impl ServerNotification {
    pub fn parse(method: &str, params: &Value) -> Self {
        match method {
            "item/agentMessage/delta" => Self::AgentMessageDelta { delta: str_field(params, "delta") },
            "item/commandExecution/outputDelta" => {
                Self::CommandOutputDelta { delta: str_field(params, "delta") }
            }
            "item/reasoning/summaryTextDelta" => {
                Self::ReasoningSummaryDelta { delta: str_field(params, "delta") }
            }
            "item/started" => Self::ItemStarted(ItemKind::parse(&params["item"])),
            "item/completed" => Self::ItemCompleted(ItemKind::parse(&params["item"])),
            "turn/diff/updated" => Self::TurnDiffUpdated { diff: str_field(params, "diff") },
            "turn/plan/updated" => {
                let steps = params
                    .get("steps")
                    .cloned()
                    .and_then(|v| serde_json::from_value(v).ok())
                    .unwrap_or_default();
                Self::TurnPlanUpdated { steps }
            }
            "turn/completed" => Self::TurnCompleted,
            "thread/tokenUsage/updated" => Self::TokenUsageUpdated(Box::new(UsageReport::from_params(params))),
            "thread/started" => Self::ThreadStarted {
                thread_id: params["thread"]["id"].as_str().map(str::to_string),
            },
            other => Self::Unrecognized { method: other.to_string() },
        }
    }
}

/// Item payloads of `item/started` and `item/completed`.
#[derive(Clone, Debug, PartialEq)]
pub enum ItemKind {
    CommandExecution { command: Value },
    FileChange { path: Option<String> },
    McpToolCall { tool: Option<String>, input: String },
    ToolCall { tool: Option<String>, input: String },
    WebSearch { query: Option<String> },
    Reasoning,
    AgentMessage,
    UserMessage,
    Unrecognized(String),
}

/// `query`, else `input`, as display text.
fn call_input(item: &Value) -> String {
    match item.get("query").or_else(|| item.get("input")) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

impl ItemKind {
    pub fn parse(item: &Value) -> Self {
        let kind = item["type"].as_str().unwrap_or_default().to_ascii_lowercase();
        let tool = || item["tool"].as_str().map(str::to_string);
        match kind.as_str() {
            "commandexecution" => Self::CommandExecution { command: item["command"].clone() },
            "filechange" => Self::FileChange {
                path: item["changes"][0]["path"].as_str().map(str::to_string),
            },
            "mcptoolcall" => Self::McpToolCall { tool: tool(), input: call_input(item) },
            "toolcall" => Self::ToolCall { tool: tool(), input: call_input(item) },
            "websearch" => Self::WebSearch {
                query: item["query"].as_str().filter(|q| !q.is_empty()).map(str::to_string),
            },
            "reasoning" => Self::Reasoning,
            "agentmessage" => Self::AgentMessage,
            "usermessage" => Self::UserMessage,
            _ => Self::Unrecognized(kind),
        }
    }

    /// Step label when this item starts, for the kinds that produce one.
    fn started_step(&self) -> Option<String> {
        match self {
            Self::CommandExecution { command } => Some(format!(
                "Bash({})",
                prefix_chars(&parse_cmd(command), COMMAND_LABEL_CHARS)
            )),
            Self::FileChange { path } => Some(format!("Editing {}", path.as_deref().unwrap_or("file"))),
            Self::McpToolCall { tool, input } => Some(format!(
                "{}({})",
                tool.as_deref().unwrap_or("mcp"),
                prefix_chars(input, TOOL_LABEL_CHARS)
            )),
            Self::ToolCall { tool, input } => Some(format!(
                "{}({})",
                tool.as_deref().unwrap_or("tool"),
                prefix_chars(input, TOOL_LABEL_CHARS)
            )),
            _ => None,
        }
    }
}

/// Display form of a shell command: with three or more words (typically
/// `bash -lc <script>`) the last word, otherwise the command as given.
pub fn parse_cmd(command: &Value) -> String {
    match command {
        Value::String(s) => match shlex::split(s) {
            Some(words) if words.len() >= 3 => words.last().cloned().unwrap_or_default(),
            _ => s.clone(),
        },
        Value::Array(parts) => {
            let words: Vec<String> = parts
                .iter()
                .map(|p| p.as_str().map(str::to_string).unwrap_or_else(|| p.to_string()))
                .collect();
            if words.len() >= 3 {
                words.last().cloned().unwrap_or_default()
            } else {
                shlex::try_join(words.iter().map(String::as_str)).unwrap_or_else(|_| words.join(" "))
            }
        }
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Apply one notification to `state`, returning the events it produces.
pub fn translate(notification: ServerNotification, state: &mut TurnState) -> Vec<TurnEvent> {
    let mut events = Vec::new();
    match notification {
        ServerNotification::AgentMessageDelta { delta } => {
            if !delta.is_empty() {
                events.push(TurnEvent::text(delta));
            }
        }
        ServerNotification::CommandOutputDelta { delta } => {
            if !delta.is_empty() {
                events.push(TurnEvent::StepData { data: delta });
            }
        }
        ServerNotification::ReasoningSummaryDelta { delta } => {
            if !state.stepped {
                state.think.push_str(&delta);
            }
        }
        ServerNotification::ItemStarted(item) => {
            if let Some(step) = item.started_step() {
                state.stepped = true;
                events.push(TurnEvent::step(step));
            } else if item == ItemKind::Reasoning {
                state.think.clear();
            } else if let ItemKind::Unrecognized(kind) = item {
                debug!(kind = %kind, "unrecognized item type");
            }
        }
        ServerNotification::ItemCompleted(item) => match item {
            ItemKind::WebSearch { query: Some(query) } => {
                state.stepped = true;
                events.push(TurnEvent::step(format!("Web Search(\"{query}\")")));
            }
            ItemKind::Reasoning => {
                if !state.think.is_empty() && !state.stepped {
                    events.push(TurnEvent::thinking(std::mem::take(&mut state.think)));
                }
            }
            _ => {}
        },
        ServerNotification::TurnDiffUpdated { diff } => state.turn_diff = diff,
        ServerNotification::TurnPlanUpdated { steps } => {
            events.extend(
                steps
                    .iter()
                    .filter_map(PlanStep::display)
                    .map(|status| TurnEvent::Status { status }),
            );
        }
        ServerNotification::TurnCompleted => state.done = true,
        ServerNotification::TokenUsageUpdated(report) => state.usage = Some(*report),
        ServerNotification::ThreadStarted { thread_id } => {
            if thread_id.is_some() {
                state.thread = thread_id;
            }
        }
        ServerNotification::Unrecognized { method } => {
            debug!(method = %method, "unrecognized notification");
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn feed(state: &mut TurnState, method: &str, params: Value) -> Vec<TurnEvent> {
        translate(ServerNotification::parse(method, &params), state)
    }

    #[test]
    fn deltas() {
        let mut state = TurnState::default();
        assert_eq!(feed(&mut state, "item/agentMessage/delta", json!({"delta": "Hi"})), vec![TurnEvent::text("Hi")]);
        assert!(feed(&mut state, "item/agentMessage/delta", json!({"delta": ""})).is_empty());
        assert_eq!(
            feed(&mut state, "item/commandExecution/outputDelta", json!({"delta": "a.txt\n"})),
            vec![TurnEvent::StepData { data: "a.txt\n".into() }]
        );
    }

    #[test]
    fn command_step_uses_parsed_script() {
        let mut state = TurnState::default();
        let events = feed(
            &mut state,
            "item/started",
            json!({"item": {"type": "commandExecution", "command": "/bin/bash -lc 'ls -la'"}}),
        );
        assert_eq!(events, vec![TurnEvent::step("Bash(ls -la)")]);
        assert!(state.stepped);
    }

    #[test]
    fn other_step_kinds() {
        let mut state = TurnState::default();
        assert_eq!(
            feed(&mut state, "item/started", json!({"item": {"type": "fileChange", "changes": [{"path": "src/lib.rs"}]}})),
            vec![TurnEvent::step("Editing src/lib.rs")]
        );
        assert_eq!(
            feed(&mut state, "item/started", json!({"item": {"type": "fileChange", "changes": []}})),
            vec![TurnEvent::step("Editing file")]
        );
        assert_eq!(
            feed(&mut state, "item/started", json!({"item": {"type": "mcpToolCall", "tool": "search", "input": "x".repeat(50)}})),
            vec![TurnEvent::step(format!("search({})", "x".repeat(40)))]
        );
        assert_eq!(
            feed(&mut state, "item/started", json!({"item": {"type": "toolCall", "query": "docs"}})),
            vec![TurnEvent::step("tool(docs)")]
        );
        assert_eq!(
            feed(&mut state, "item/completed", json!({"item": {"type": "webSearch", "query": "tokio select"}})),
            vec![TurnEvent::step("Web Search(\"tokio select\")")]
        );
        assert!(feed(&mut state, "item/completed", json!({"item": {"type": "webSearch"}})).is_empty());
    }

    #[test]
    fn reasoning_flushes_once_when_not_stepped() {
        let mut state = TurnState::default();
        feed(&mut state, "item/started", json!({"item": {"type": "reasoning"}}));
        feed(&mut state, "item/reasoning/summaryTextDelta", json!({"delta": "Looking "}));
        feed(&mut state, "item/reasoning/summaryTextDelta", json!({"delta": "around"}));
        assert_eq!(
            feed(&mut state, "item/completed", json!({"item": {"type": "reasoning"}})),
            vec![TurnEvent::thinking("Looking around")]
        );
        assert!(feed(&mut state, "item/completed", json!({"item": {"type": "reasoning"}})).is_empty());
    }

    #[test]
    fn reasoning_suppressed_after_step() {
        let mut state = TurnState::default();
        feed(&mut state, "item/started", json!({"item": {"type": "commandExecution", "command": "ls"}}));
        feed(&mut state, "item/started", json!({"item": {"type": "reasoning"}}));
        feed(&mut state, "item/reasoning/summaryTextDelta", json!({"delta": "more"}));
        assert!(feed(&mut state, "item/completed", json!({"item": {"type": "reasoning"}})).is_empty());
        assert!(state.think.is_empty());
    }

    #[test]
    fn plan_updates_become_status() {
        let mut state = TurnState::default();
        let events = feed(
            &mut state,
            "turn/plan/updated",
            json!({"steps": [
                {"label": "Read code", "status": "completed"},
                {"title": "Write tests", "status": "in_progress"},
                {"label": "", "status": "pending"}
            ]}),
        );
        assert_eq!(
            events,
            vec![
                TurnEvent::Status { status: "[x] Read code".into() },
                TurnEvent::Status { status: "[ ] Write tests".into() },
            ]
        );
    }

    #[test]
    fn state_updates() {
        let mut state = TurnState::default();
        feed(&mut state, "thread/started", json!({"thread": {"id": "thr_9"}}));
        feed(&mut state, "turn/diff/updated", json!({"diff": "--- a/x\n+++ b/x\n"}));
        feed(
            &mut state,
            "thread/tokenUsage/updated",
            json!({"tokenUsage": {"total": {"inputTokens": 10, "outputTokens": 2, "cachedInputTokens": 0}}}),
        );
        assert!(!state.should_stop());
        feed(&mut state, "turn/completed", json!({}));

        assert_eq!(state.thread.as_deref(), Some("thr_9"));
        assert!(state.turn_diff.starts_with("--- a/x"));
        assert_eq!(state.usage.as_ref().unwrap().token_usage.total.input_tokens, 10);
        assert!(state.should_stop());
    }

    #[test]
    fn malformed_usage_is_still_reported() {
        let mut state = TurnState::default();
        feed(&mut state, "thread/tokenUsage/updated", json!({"threadId": "thr_9", "tokenUsage": null}));
        let usage = state.usage.expect("usage kept");
        assert_eq!(usage.token_usage.total.input_tokens, 0);
        assert_eq!(usage.extra["threadId"], "thr_9");
    }

    #[test]
    fn unknown_methods_and_items_are_inert() {
        let mut state = TurnState::default();
        assert_eq!(
            ServerNotification::parse("account/rateLimits/updated", &json!({})),
            ServerNotification::Unrecognized { method: "account/rateLimits/updated".into() }
        );
        assert!(feed(&mut state, "account/rateLimits/updated", json!({})).is_empty());
        assert!(feed(&mut state, "item/started", json!({"item": {"type": "imageView"}})).is_empty());
        assert_eq!(ItemKind::parse(&json!({"type": "imageView"})), ItemKind::Unrecognized("imageview".into()));
        assert_eq!(state, TurnState::default());
    }

    #[test]
    fn parse_cmd_forms() {
        assert_eq!(parse_cmd(&json!("bash -lc 'cat a.txt | wc -l'")), "cat a.txt | wc -l");
        assert_eq!(parse_cmd(&json!("ls -la")), "ls -la");
        assert_eq!(parse_cmd(&json!("echo 'unterminated")), "echo 'unterminated");
        assert_eq!(parse_cmd(&json!(["/bin/zsh", "-lc", "git status"])), "git status");
        assert_eq!(parse_cmd(&json!(["ls", "-la"])), "ls -la");
        assert_eq!(parse_cmd(&Value::Null), "");
    }
}
