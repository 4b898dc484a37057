use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{FutureExt, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use strand_core::approval::{ApprovalPolicy, PendingApproval};
use strand_core::context::LlmContext;
use strand_core::errors::GatewayError;
use strand_core::events::{EventSink, TurnEvent};
use strand_core::messages::{BlockKind, ContentBlock, Message, StopReason, ToolResultContent, ToolUse};
use strand_core::provider::LlmProvider;
use strand_core::stream::StreamEvent;
use strand_core::tokens::{TokenUsage, UsageStats};
use strand_core::tools::{ToolContext, ToolResult};

use crate::config::StreamingConfig;
use crate::error::EngineError;
use crate::registry::ToolRegistry;
use crate::tools::web_search::{search_label, WEB_SEARCH_TOOL_NAME};

pub const APPROVAL_METHOD: &str = "requestApproval";
pub const APPROVAL_DENIED: &str = "Command approval was denied by the user.";
pub const APPROVAL_SKIPPED: &str = "Skipped: an earlier command in this step is awaiting approval.";
pub const CALL_NOT_RUN: &str = "Error: tool call not run because the response was cut short.";

/// What a finished loop leaves behind for the controller.
#[derive(Debug, Default)]
pub struct RunOutcome {
    pub usage: UsageStats,
    pub steps: u32,
    /// Set when the loop stopped on a gated command.
    pub pending: Option<PendingApproval>,
}

/// Per-turn inputs of the loop.
pub struct RunParams<'a> {
    pub tool_ctx: ToolContext,
    pub policy: ApprovalPolicy,
    pub sink: &'a EventSink,
}

impl RunParams<'_> {
    fn cancel(&self) -> &CancellationToken {
        &self.tool_ctx.abort_signal
    }
}

struct Generation {
    content: Vec<ContentBlock>,
    stop_reason: StopReason,
    usage: TokenUsage,
}

/// Drives generation calls against the streaming engine, dispatching the
/// client tools it asks for until it stops asking.
pub struct StreamingRunner {
    provider: Arc<dyn LlmProvider>,
    registry: Arc<ToolRegistry>,
    config: StreamingConfig,
}

impl StreamingRunner {
    pub fn new(provider: Arc<dyn LlmProvider>, registry: Arc<ToolRegistry>, config: StreamingConfig) -> Self {
        Self { provider, registry, config }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Run the loop, appending every assistant and tool-result message to
    /// `messages`. On error the transcript is left with a result for every
    /// tool call, so it stays valid for the next turn.
    #[instrument(skip_all, fields(session_id = %params.tool_ctx.session_id, provider = self.provider.name()))]
    pub async fn run(&self, messages: &mut Vec<Message>, params: &RunParams<'_>) -> Result<RunOutcome, EngineError> {
        let result = self.run_steps(messages, params).await;
        if let Err(e) = &result {
            let filled = backfill_unmatched(messages, &format!("Error: {e}"));
            if filled > 0 {
                warn!(filled, error = %e, "added results for unanswered tool calls");
            }
        }
        result
    }

    async fn run_steps(&self, messages: &mut Vec<Message>, params: &RunParams<'_>) -> Result<RunOutcome, EngineError> {
        let options = self.config.stream_options();
        let tools = self.registry.definitions();
        let mut outcome = RunOutcome::default();

        loop {
            if outcome.steps >= self.config.max_steps {
                return Err(EngineError::MaxStepsExceeded(self.config.max_steps));
            }
            outcome.steps += 1;

            let context = LlmContext::new(messages.clone())
                .with_system(self.config.system.clone())
                .with_tools(tools.clone());
            let generation = self.generate(&context, &options, params).await?;
            outcome.usage.accumulate(&generation.usage);

            let calls: Vec<ToolUse> = generation
                .content
                .iter()
                .filter_map(|block| match &block.kind {
                    BlockKind::ToolUse(tool_use) => Some(tool_use.clone()),
                    _ => None,
                })
                .collect();
            if !generation.content.is_empty() {
                messages.push(Message::assistant_blocks(generation.content));
            }

            if generation.stop_reason != StopReason::ToolUse || calls.is_empty() {
                if !calls.is_empty() {
                    let filled = backfill_unmatched(messages, CALL_NOT_RUN);
                    warn!(filled, stop_reason = ?generation.stop_reason, "tool calls left unrun");
                }
                info!(steps = outcome.steps, stop_reason = ?generation.stop_reason, "loop finished");
                return Ok(outcome);
            }

            for call in &calls {
                let event = match self.registry.get(&call.name) {
                    Some(tool) => tool.announce(&call.input),
                    None => TurnEvent::step(format!("{}()", call.name)),
                };
                params.sink.emit(event).await?;
            }

            if params.policy.gates_commands() {
                if let Some(pending) = self.gate(&calls, messages, params).await? {
                    outcome.pending = Some(pending);
                    return Ok(outcome);
                }
            }

            let results = self.execute_tools(&calls, params).await?;

            for (call, result) in calls.iter().zip(&results) {
                let reports = self.registry.get(&call.name).is_some_and(|t| t.reports_output());
                if reports {
                    params.sink.emit(TurnEvent::StepData { data: result.content.as_text() }).await?;
                }
            }

            let blocks = calls
                .iter()
                .zip(results)
                .map(|(call, result)| ContentBlock::tool_result(call.id.clone(), result.content, result.is_error))
                .collect();
            messages.push(Message::user_blocks(blocks));
        }
    }

    /// One generation call. Text is forwarded as it streams; thinking and
    /// server-side searches are reported once their block closes.
    async fn generate(
        &self,
        context: &LlmContext,
        options: &strand_core::provider::StreamOptions,
        params: &RunParams<'_>,
    ) -> Result<Generation, EngineError> {
        let cancel = params.cancel();
        let mut stream = tokio::select! {
            stream = self.provider.stream(context, options) => stream?,
            _ = cancel.cancelled() => return Err(EngineError::Aborted),
        };

        loop {
            let event = tokio::select! {
                event = stream.next() => event,
                _ = cancel.cancelled() => return Err(EngineError::Aborted),
            };
            match event {
                Some(StreamEvent::TextDelta { delta }) if !delta.is_empty() => {
                    params.sink.emit(TurnEvent::text(delta)).await?;
                }
                Some(StreamEvent::ThinkingEnd { thinking, .. }) if !thinking.is_empty() => {
                    params.sink.emit(TurnEvent::thinking(thinking)).await?;
                }
                Some(StreamEvent::ToolCallEnd { tool_use, server_side: true }) if tool_use.name == WEB_SEARCH_TOOL_NAME => {
                    params.sink.emit(TurnEvent::step(search_label(&tool_use.input))).await?;
                }
                Some(StreamEvent::Done { content, stop_reason, usage }) => {
                    debug!(blocks = content.len(), ?stop_reason, input_tokens = usage.input_tokens, "generation done");
                    return Ok(Generation { content, stop_reason, usage });
                }
                Some(StreamEvent::Error { error }) => return Err(error.into()),
                Some(_) => {}
                None => {
                    return Err(GatewayError::StreamInterrupted("stream ended before completion".into()).into());
                }
            }
        }
    }

    /// Under a gating policy a step holding a command is not run at all: the
    /// first command is reported for approval and every call gets a
    /// synthetic result.
    async fn gate(
        &self,
        calls: &[ToolUse],
        messages: &mut Vec<Message>,
        params: &RunParams<'_>,
    ) -> Result<Option<PendingApproval>, EngineError> {
        let gated = calls
            .iter()
            .position(|call| self.registry.get(&call.name).is_some_and(|t| t.requires_approval()));
        let Some(gated) = gated else {
            return Ok(None);
        };

        let command = command_of(&calls[gated].input);
        info!(command = %command, "command held for approval");
        params
            .sink
            .emit(TurnEvent::Approval {
                method: APPROVAL_METHOD.into(),
                command: command.clone(),
                cwd: Some(params.tool_ctx.workspace.display().to_string()),
                reason: None,
            })
            .await?;
        let pending = PendingApproval::new(APPROVAL_METHOD, command);
        params.sink.emit(pending.to_event()).await?;

        let blocks = calls
            .iter()
            .enumerate()
            .map(|(i, call)| {
                let text = if i == gated { APPROVAL_DENIED } else { APPROVAL_SKIPPED };
                ContentBlock::tool_result(call.id.clone(), ToolResultContent::Text(text.into()), true)
            })
            .collect();
        messages.push(Message::user_blocks(blocks));
        Ok(Some(pending))
    }

    /// Run every call concurrently and return the results in call order.
    async fn execute_tools(&self, calls: &[ToolUse], params: &RunParams<'_>) -> Result<Vec<ToolResult>, EngineError> {
        let timeout = self.config.tool_timeout();
        let mut handles = Vec::with_capacity(calls.len());

        for call in calls {
            let tool = self.registry.get(&call.name);
            let call = call.clone();
            let ctx = params.tool_ctx.clone();

            handles.push(tokio::spawn(async move {
                let Some(tool) = tool else {
                    warn!(tool = %call.name, "engine asked for an unknown tool");
                    return ToolResult::error(format!("Error: unknown tool {}", call.name), Duration::ZERO);
                };

                let start = Instant::now();
                let result = tokio::time::timeout(
                    timeout,
                    std::panic::AssertUnwindSafe(tool.execute(call.input.clone(), &ctx)).catch_unwind(),
                )
                .await;
                let duration = start.elapsed();

                match result {
                    Ok(Ok(Ok(result))) => result,
                    Ok(Ok(Err(e))) => ToolResult::error(format!("Error: {e}"), duration),
                    Ok(Err(panic)) => {
                        error!(tool = %call.name, panic = %panic_message(&panic), "tool panicked during execution");
                        ToolResult::error("Error: tool crashed", duration)
                    }
                    Err(_) => {
                        warn!(tool = %call.name, timeout_secs = timeout.as_secs(), "tool timed out");
                        ToolResult::error(
                            format!("Error: tool {} timed out after {}s", call.name, timeout.as_secs()),
                            duration,
                        )
                    }
                }
            }));
        }

        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let joined = tokio::select! {
            joined = futures::future::join_all(handles) => joined,
            _ = params.cancel().cancelled() => {
                for abort in aborts {
                    abort.abort();
                }
                return Err(EngineError::Aborted);
            }
        };

        Ok(joined
            .into_iter()
            .zip(calls)
            .map(|(joined, call)| match joined {
                Ok(result) => result,
                Err(join_err) => {
                    error!(tool = %call.name, error = %join_err, "tool task failed");
                    ToolResult::error("Error: tool execution failed", Duration::ZERO)
                }
            })
            .collect())
    }
}

fn command_of(input: &Value) -> String {
    input.get("command").and_then(Value::as_str).unwrap_or_default().to_string()
}

/// Append a result for every tool call of the last assistant message that
/// has none yet. Returns how many were added.
pub fn backfill_unmatched(messages: &mut Vec<Message>, error: &str) -> usize {
    let Some(pos) = messages.iter().rposition(|m| !m.tool_uses().is_empty()) else {
        return 0;
    };
    let answered: HashSet<_> = messages[pos + 1..]
        .iter()
        .flat_map(|m| m.tool_result_ids())
        .cloned()
        .collect();
    let blocks: Vec<ContentBlock> = messages[pos]
        .tool_uses()
        .into_iter()
        .filter(|call| !answered.contains(&call.id))
        .map(|call| ContentBlock::tool_result(call.id.clone(), ToolResultContent::Text(error.into()), true))
        .collect();
    let filled = blocks.len();
    if filled > 0 {
        messages.push(Message::user_blocks(blocks));
    }
    filled
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use strand_core::ids::{SessionId, ToolCallId};
    use strand_core::messages::Role;
    use strand_core::tools::{Tool, ToolDefinition, ToolError};
    use strand_llm::mock::{MockProvider, MockResponse, MockTurn};

    use crate::config::SandboxConfig;
    use crate::registry::ToolSource;
    use crate::sandbox::Sandbox;
    use crate::tools::create_default_registry;

    struct SlowTool {
        name: &'static str,
        delay: Duration,
    }

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            self.name
        }
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::builtin(self.name, "test")
        }
        fn describe(&self, _args: &Value) -> String {
            format!("Run {}", self.name)
        }
        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
            tokio::time::sleep(self.delay).await;
            Ok(ToolResult::text(format!("{} done", self.name), self.delay))
        }
    }

    struct PanicTool;

    #[async_trait]
    impl Tool for PanicTool {
        fn name(&self) -> &str {
            "boom"
        }
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::builtin("boom", "test")
        }
        fn describe(&self, _args: &Value) -> String {
            "Boom".into()
        }
        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
            panic!("kaboom")
        }
    }

    fn default_registry() -> Arc<ToolRegistry> {
        Arc::new(create_default_registry(&Sandbox::new(SandboxConfig::unconfined()), &[]))
    }

    fn runner(provider: Arc<MockProvider>, registry: Arc<ToolRegistry>) -> StreamingRunner {
        StreamingRunner::new(provider, registry, StreamingConfig::default())
    }

    struct Harness {
        dir: tempfile::TempDir,
        sink: EventSink,
        rx: tokio::sync::mpsc::Receiver<TurnEvent>,
        cancel: CancellationToken,
    }

    impl Harness {
        fn new() -> Self {
            let (sink, rx) = EventSink::channel(256);
            Self { dir: tempfile::tempdir().unwrap(), sink, rx, cancel: CancellationToken::new() }
        }

        fn params(&self, policy: ApprovalPolicy) -> RunParams<'_> {
            RunParams {
                tool_ctx: ToolContext {
                    session_id: SessionId::from_raw("s1"),
                    workspace: self.dir.path().to_path_buf(),
                    abort_signal: self.cancel.clone(),
                },
                policy,
                sink: &self.sink,
            }
        }

        fn events(&mut self) -> Vec<TurnEvent> {
            let mut events = Vec::new();
            while let Ok(ev) = self.rx.try_recv() {
                events.push(ev);
            }
            events
        }
    }

    #[tokio::test]
    async fn text_only_turn() {
        let provider = Arc::new(MockProvider::new(vec![MockTurn::new()
            .thinking("pondering")
            .text("Hello!")
            .usage(120, 8)
            .build()]));
        let mut h = Harness::new();
        let mut messages = vec![Message::user_text("hi")];

        let outcome = runner(provider.clone(), default_registry())
            .run(&mut messages, &h.params(ApprovalPolicy::Never))
            .await
            .unwrap();

        assert_eq!(outcome.steps, 1);
        assert_eq!(outcome.usage.input_tokens, 120);
        assert_eq!(outcome.usage.output_tokens, 8);
        assert!(outcome.pending.is_none());
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(h.events(), vec![TurnEvent::thinking("pondering"), TurnEvent::text("Hello!")]);

        let request = &provider.requests()[0];
        assert_eq!(request.tools.len(), 3);
    }

    #[tokio::test]
    async fn calls_in_a_cut_short_response_still_get_results() {
        let provider = Arc::new(MockProvider::new(vec![MockTurn::new()
            .tool_use("toolu_1", "bash", json!({"command": "ls"}))
            .stop_reason(StopReason::MaxTokens)
            .build()]));
        let h = Harness::new();
        let mut messages = vec![Message::user_text("hi")];

        let outcome = runner(provider, default_registry())
            .run(&mut messages, &h.params(ApprovalPolicy::Never))
            .await
            .unwrap();

        assert_eq!(outcome.steps, 1);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2].role, Role::User);
        let ids: Vec<&str> = messages[2].tool_result_ids().iter().map(|id| id.as_str()).collect();
        assert_eq!(ids, vec!["toolu_1"]);
        match &messages[2].blocks()[0].kind {
            BlockKind::ToolResult(result) => {
                assert!(result.is_error);
                assert_eq!(result.content.as_text(), CALL_NOT_RUN);
            }
            other => panic!("expected tool result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn bash_step_reports_output_then_continues() {
        let provider = Arc::new(MockProvider::new(vec![
            MockTurn::new().tool_use("toolu_1", "bash", json!({"command": "ls"})).usage(100, 5).build(),
            MockTurn::new().text("One file.").usage(150, 4).build(),
        ]));
        let mut h = Harness::new();
        std::fs::write(h.dir.path().join("a.txt"), "x").unwrap();
        let mut messages = vec![Message::user_text("list files")];

        let outcome = runner(provider.clone(), default_registry())
            .run(&mut messages, &h.params(ApprovalPolicy::Never))
            .await
            .unwrap();

        assert_eq!(outcome.steps, 2);
        assert_eq!(outcome.usage.input_tokens, 250);
        assert_eq!(
            h.events(),
            vec![
                TurnEvent::step("Bash(ls)"),
                TurnEvent::StepData { data: "a.txt".into() },
                TurnEvent::text("One file."),
            ]
        );
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[2].tool_result_ids(), vec![&ToolCallId::from_raw("toolu_1")]);
        // The second call sees the tool result.
        assert_eq!(provider.requests()[1].messages.len(), 3);
    }

    #[tokio::test]
    async fn server_side_search_is_reported_not_dispatched() {
        let provider = Arc::new(MockProvider::new(vec![MockTurn::new()
            .server_tool_use("srvtoolu_1", "web_search", json!({"query": "rust"}))
            .text("Found it.")
            .build()]));
        let mut h = Harness::new();
        let mut messages = vec![Message::user_text("search")];

        let outcome = runner(provider.clone(), default_registry())
            .run(&mut messages, &h.params(ApprovalPolicy::Never))
            .await
            .unwrap();

        assert_eq!(outcome.steps, 1);
        assert_eq!(h.events(), vec![TurnEvent::step("Web Search(\"rust\")"), TurnEvent::text("Found it.")]);
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_results_keep_call_order() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(SlowTool { name: "slow", delay: Duration::from_millis(200) }), ToolSource::BuiltIn);
        registry.register(Arc::new(SlowTool { name: "fast", delay: Duration::from_millis(1) }), ToolSource::BuiltIn);
        let provider = Arc::new(MockProvider::new(vec![
            MockTurn::new()
                .tool_use("t1", "slow", json!({}))
                .tool_use("t2", "fast", json!({}))
                .tool_use("t3", "missing", json!({}))
                .build(),
            MockResponse::text("done"),
        ]));
        let mut h = Harness::new();
        let mut messages = vec![Message::user_text("go")];

        let started = Instant::now();
        runner(provider, Arc::new(registry))
            .run(&mut messages, &h.params(ApprovalPolicy::Never))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(390));

        let results: Vec<(String, String, bool)> = messages[2]
            .blocks()
            .iter()
            .filter_map(|b| match &b.kind {
                BlockKind::ToolResult(r) => Some((r.tool_use_id.as_str().to_string(), r.content.as_text(), r.is_error)),
                _ => None,
            })
            .collect();
        assert_eq!(
            results,
            vec![
                ("t1".into(), "slow done".into(), false),
                ("t2".into(), "fast done".into(), false),
                ("t3".into(), "Error: unknown tool missing".into(), true),
            ]
        );
        assert_eq!(
            h.events(),
            vec![
                TurnEvent::step("Run slow"),
                TurnEvent::step("Run fast"),
                TurnEvent::step("missing()"),
                TurnEvent::text("done"),
            ]
        );
    }

    #[tokio::test]
    async fn panics_and_timeouts_become_error_results() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(PanicTool), ToolSource::BuiltIn);
        registry.register(Arc::new(SlowTool { name: "hang", delay: Duration::from_secs(30) }), ToolSource::BuiltIn);
        let provider = Arc::new(MockProvider::new(vec![
            MockTurn::new().tool_use("t1", "boom", json!({})).tool_use("t2", "hang", json!({})).build(),
            MockResponse::text("ok"),
        ]));
        let config = StreamingConfig { tool_timeout: 1, ..StreamingConfig::default() };
        let runner = StreamingRunner::new(provider, Arc::new(registry), config);
        let h = Harness::new();
        let mut messages = vec![Message::user_text("go")];

        runner.run(&mut messages, &h.params(ApprovalPolicy::Never)).await.unwrap();

        let texts: Vec<String> = messages[2]
            .blocks()
            .iter()
            .filter_map(|b| match &b.kind {
                BlockKind::ToolResult(r) => Some(r.content.as_text()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["Error: tool crashed", "Error: tool hang timed out after 1s"]);
    }

    #[tokio::test]
    async fn gated_command_is_not_run() {
        let provider = Arc::new(MockProvider::new(vec![MockTurn::new()
            .tool_use("t1", "str_replace_based_edit_tool", json!({"command": "view", "path": "notes.txt"}))
            .tool_use("t2", "bash", json!({"command": "touch made.txt"}))
            .build()]));
        let mut h = Harness::new();
        let mut messages = vec![Message::user_text("make a file")];

        let outcome = runner(provider.clone(), default_registry())
            .run(&mut messages, &h.params(ApprovalPolicy::OnRequest))
            .await
            .unwrap();

        assert!(!h.dir.path().join("made.txt").exists());
        assert_eq!(provider.call_count(), 1);
        assert_eq!(outcome.pending, Some(PendingApproval::new("requestApproval", "touch made.txt")));

        let events = h.events();
        assert_eq!(events[0], TurnEvent::step("Viewing notes.txt"));
        assert_eq!(events[1], TurnEvent::step("Bash(touch made.txt)"));
        assert_eq!(
            events[2],
            TurnEvent::Approval {
                method: "requestApproval".into(),
                command: "touch made.txt".into(),
                cwd: Some(h.dir.path().display().to_string()),
                reason: None,
            }
        );
        assert_eq!(
            events[3],
            TurnEvent::PendingApproval {
                action_type: "requestApproval".into(),
                action_detail: Some("touch made.txt".into()),
            }
        );

        let last = messages.last().unwrap();
        assert_eq!(last.tool_result_ids().len(), 2);
        let texts: Vec<String> = last
            .blocks()
            .iter()
            .filter_map(|b| match &b.kind {
                BlockKind::ToolResult(r) => Some(r.content.as_text()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec![APPROVAL_SKIPPED, APPROVAL_DENIED]);
    }

    #[tokio::test]
    async fn gating_ignores_steps_without_commands() {
        let provider = Arc::new(MockProvider::new(vec![
            MockTurn::new()
                .tool_use("t1", "str_replace_based_edit_tool", json!({"command": "create", "path": "a.txt", "file_text": "hi"}))
                .build(),
            MockResponse::text("Created."),
        ]));
        let h = Harness::new();
        let mut messages = vec![Message::user_text("write")];

        let outcome = runner(provider, default_registry())
            .run(&mut messages, &h.params(ApprovalPolicy::Untrusted))
            .await
            .unwrap();
        assert!(outcome.pending.is_none());
        assert_eq!(std::fs::read_to_string(h.dir.path().join("a.txt")).unwrap(), "hi");
    }

    #[tokio::test]
    async fn stream_error_backfills_unanswered_calls() {
        let mut messages = vec![
            Message::user_text("go"),
            Message::assistant_blocks(vec![
                ContentBlock::tool_use(ToolCallId::from_raw("t1"), "bash", json!({"command": "ls"})),
                ContentBlock::tool_use(ToolCallId::from_raw("t2"), "bash", json!({"command": "pwd"})),
            ]),
        ];
        let provider = Arc::new(MockProvider::new(vec![MockResponse::stream_error(GatewayError::ProviderOverloaded)]));
        let h = Harness::new();

        let err = runner(provider, default_registry())
            .run(&mut messages, &h.params(ApprovalPolicy::Never))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Gateway(GatewayError::ProviderOverloaded)));

        assert_eq!(messages.len(), 3);
        let last = &messages[2];
        assert_eq!(last.tool_result_ids().len(), 2);
        assert_eq!(last.text_content(), "");
        match &last.blocks()[0].kind {
            BlockKind::ToolResult(r) => {
                assert!(r.is_error);
                assert_eq!(r.content.as_text(), format!("Error: {err}"));
            }
            other => panic!("expected tool result, got {other:?}"),
        }
    }

    #[test]
    fn backfill_skips_answered_calls() {
        let mut messages = vec![
            Message::assistant_blocks(vec![
                ContentBlock::tool_use(ToolCallId::from_raw("t1"), "bash", json!({})),
                ContentBlock::tool_use(ToolCallId::from_raw("t2"), "bash", json!({})),
            ]),
            Message::user_blocks(vec![ContentBlock::tool_result(
                ToolCallId::from_raw("t1"),
                ToolResultContent::Text("ok".into()),
                false,
            )]),
        ];
        assert_eq!(backfill_unmatched(&mut messages, "Error: x"), 1);
        assert_eq!(messages[2].tool_result_ids(), vec![&ToolCallId::from_raw("t2")]);
        assert_eq!(backfill_unmatched(&mut messages, "Error: x"), 0);
    }

    #[tokio::test]
    async fn step_ceiling_stops_the_loop() {
        let responses = (0..3)
            .map(|i| MockResponse::tool_use(&format!("t{i}"), "bash", json!({"command": "true"})))
            .collect();
        let provider = Arc::new(MockProvider::new(responses));
        let config = StreamingConfig { max_steps: 2, ..StreamingConfig::default() };
        let runner = StreamingRunner::new(provider.clone(), default_registry(), config);
        let h = Harness::new();
        let mut messages = vec![Message::user_text("loop")];

        let err = runner.run(&mut messages, &h.params(ApprovalPolicy::Never)).await.unwrap_err();
        assert!(matches!(err, EngineError::MaxStepsExceeded(2)));
        assert_eq!(provider.call_count(), 2);
        // Every call was answered before the ceiling hit.
        assert_eq!(backfill_unmatched(&mut messages, "x"), 0);
    }

    #[tokio::test]
    async fn cancellation_aborts_a_slow_call() {
        let provider = Arc::new(MockProvider::new(vec![MockResponse::delayed(
            Duration::from_secs(30),
            MockResponse::text("late"),
        )]));
        let h = Harness::new();
        let cancel = h.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let mut messages = vec![Message::user_text("hi")];

        let err = runner(provider, default_registry())
            .run(&mut messages, &h.params(ApprovalPolicy::Never))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Aborted));
        assert!(err.is_silent());
    }

    #[tokio::test]
    async fn truncated_stream_is_an_error() {
        let provider = Arc::new(MockProvider::new(vec![MockResponse::Stream(vec![
            StreamEvent::Start,
            StreamEvent::TextDelta { delta: "par".into() },
        ])]));
        let mut h = Harness::new();
        let mut messages = vec![Message::user_text("hi")];

        let err = runner(provider, default_registry())
            .run(&mut messages, &h.params(ApprovalPolicy::Never))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Gateway(GatewayError::StreamInterrupted(_))));
        assert_eq!(h.events(), vec![TurnEvent::text("par")]);
        assert_eq!(messages.len(), 1);
    }
}
