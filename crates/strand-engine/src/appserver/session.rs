//! One turn of the subprocess engine's protocol: bootstrap, thread selection,
//! turn execution and the inbound requests the engine makes along the way.

use std::path::PathBuf;

use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use strand_core::approval::{ApprovalPolicy, PendingApproval};
use strand_core::events::{CalloutStyle, EventSink, TurnEvent};
use strand_core::tools::CustomToolSpec;

use super::rpc::{Incoming, RpcConnection};
use super::DriverError;
use crate::config::AppServerConfig;
use crate::tools::render::rendered_message;
use crate::translate::{parse_cmd, translate, ServerNotification, TurnState};

pub const SESSION_EXPIRED: &str = "Session expired. Please start a new conversation.";

/// Everything one subprocess turn needs from the caller.
#[derive(Clone, Debug)]
pub struct DriverTurn {
    pub workspace: PathBuf,
    pub prompt: String,
    /// Thread to resume; a new thread is started when absent.
    pub session_id: Option<String>,
    pub tools: Vec<CustomToolSpec>,
    pub policy: ApprovalPolicy,
}

/// What a `call` ended with.
#[derive(Debug, Default)]
pub struct CallOutcome {
    /// The matching response, if one arrived.
    pub response: Option<Incoming>,
}

impl CallOutcome {
    fn result(&self) -> Option<&Value> {
        match &self.response {
            Some(Incoming::Response { result, .. }) => result.as_ref(),
            _ => None,
        }
    }

    fn error(&self) -> Option<&Value> {
        match &self.response {
            Some(Incoming::Response { error, .. }) => error.as_ref(),
            _ => None,
        }
    }
}

pub struct ProtocolSession<'a, R, W> {
    conn: &'a mut RpcConnection<R, W>,
    config: &'a AppServerConfig,
    sink: &'a EventSink,
    cancel: &'a CancellationToken,
    pub state: TurnState,
}

impl<'a, R, W> ProtocolSession<'a, R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(
        conn: &'a mut RpcConnection<R, W>,
        config: &'a AppServerConfig,
        sink: &'a EventSink,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self { conn, config, sink, cancel, state: TurnState::default() }
    }

    /// Send `method` and read until its response arrives. With `until_stop`,
    /// keep reading past the response until the turn is done or awaiting
    /// approval. Notifications are translated and requests answered as they
    /// come, in arrival order.
    pub async fn call(
        &mut self,
        method: &str,
        params: Option<&Value>,
        until_stop: bool,
    ) -> Result<CallOutcome, DriverError> {
        let id = self.conn.request(method, params).await?;
        debug!(id, method, "rpc call");
        let mut outcome = CallOutcome::default();
        loop {
            let next = tokio::select! {
                msg = self.conn.next_message() => msg?,
                _ = self.cancel.cancelled() => return Err(DriverError::Cancelled),
            };
            let Some(msg) = next else {
                debug!(method, "engine output closed");
                return Ok(outcome);
            };
            match msg {
                msg @ Incoming::Response { .. } => {
                    if msg.answers(id) {
                        outcome.response = Some(msg);
                        if !until_stop {
                            return Ok(outcome);
                        }
                    } else {
                        debug!(expected = id, "ignoring response for another request");
                    }
                }
                Incoming::Request { id, method, params } => {
                    self.handle_request(&id, &method, &params).await?;
                }
                Incoming::Notification { method, params } => {
                    let events = translate(ServerNotification::parse(&method, &params), &mut self.state);
                    self.sink.emit_all(events).await?;
                }
            }
            if until_stop && self.state.should_stop() {
                return Ok(outcome);
            }
        }
    }

    async fn handle_request(&mut self, id: &Value, method: &str, params: &Value) -> Result<(), DriverError> {
        if method == "item/tool/call" {
            let tool = params["tool"].as_str().unwrap_or_default().to_string();
            let args = match &params["arguments"] {
                Value::String(raw) => serde_json::from_str(raw).unwrap_or_else(|_| json!({})),
                Value::Null => json!({}),
                other => other.clone(),
            };
            self.sink.emit(TurnEvent::ToolCall { tool: tool.clone(), args }).await?;
            let reply = json!({
                "contentItems": [{"type": "inputText", "text": rendered_message(&tool)}],
                "success": true,
            });
            self.conn.reply(id, &reply).await?;
        } else if method.contains("requestApproval") {
            let command = approval_command(params);
            self.conn.reply(id, &json!({"decision": "decline"})).await?;
            info!(method, command = %command, "declined approval request");
            let pending = PendingApproval::new(method, command.clone());
            self.sink
                .emit(TurnEvent::Approval {
                    method: method.to_string(),
                    command,
                    cwd: params["cwd"].as_str().map(str::to_string),
                    reason: params["reason"].as_str().map(str::to_string),
                })
                .await?;
            self.sink.emit(pending.to_event()).await?;
            self.state.approval = true;
        } else {
            debug!(method, "declining unsupported request");
            self.conn.reply(id, &json!({"decision": "decline"})).await?;
        }
        Ok(())
    }

    /// Drive a full turn. Engine-reported failures become callouts; only
    /// transport failures and cancellation are returned as errors.
    #[instrument(skip_all, fields(resume = turn.session_id.is_some()))]
    pub async fn run(&mut self, turn: &DriverTurn) -> Result<(), DriverError> {
        let init = json!({
            "clientInfo": {"name": self.config.client_name, "version": self.config.client_version},
            "capabilities": {"experimentalApi": true},
        });
        let initialized = match self.call("initialize", Some(&init), false).await {
            Ok(outcome) => outcome.response.is_some(),
            // An engine that dies on startup may close stdin before the request lands.
            Err(DriverError::Io(e)) => {
                debug!(error = %e, "engine unavailable during initialize");
                false
            }
            Err(e) => return Err(e),
        };
        if !initialized {
            return Err(DriverError::NoResponse("initialize".into()));
        }
        self.conn.notify("initialized", None).await?;

        let mut params = json!({
            "approvalPolicy": turn.policy.as_str(),
            "sandbox": self.config.sandbox_mode,
            "dynamicTools": turn.tools,
        });
        if let Some(model) = &self.config.model {
            params["model"] = json!(model);
        }
        let method = match &turn.session_id {
            Some(session) => {
                params["threadId"] = json!(session);
                "thread/resume"
            }
            None => {
                params["cwd"] = json!(turn.workspace.to_string_lossy());
                "thread/start"
            }
        };
        let thread = self.call(method, Some(&params), false).await?;
        if let Some(error) = thread.error() {
            warn!(method, error = %error, "thread request failed");
            let event = if turn.session_id.is_some() {
                TurnEvent::callout(CalloutStyle::Warning, SESSION_EXPIRED)
            } else {
                TurnEvent::error(format!("{method} failed: {}", error_message(error)))
            };
            self.sink.emit(event).await?;
            return Ok(());
        }

        let thread_id = thread
            .result()
            .and_then(|r| r["thread"]["id"].as_str())
            .map(str::to_string)
            .or_else(|| self.state.thread.clone())
            .or_else(|| turn.session_id.clone());
        if let Some(tid) = &thread_id {
            self.sink.emit(TurnEvent::SessionId { session_id: tid.clone() }).await?;
        }

        let mut params = json!({
            "threadId": thread_id,
            "input": [{"type": "text", "text": turn.prompt}],
        });
        if let Some(effort) = &self.config.effort {
            params["effort"] = json!(effort);
        }
        self.call("turn/start", Some(&params), true).await?;

        if !self.state.turn_diff.is_empty() {
            let diff = self.state.turn_diff.clone();
            self.sink.emit(TurnEvent::Diff { diff }).await?;
        }
        if let Some(usage) = self.state.usage.clone() {
            self.sink.emit(TurnEvent::Usage { usage }).await?;
        }
        Ok(())
    }
}

/// Command text for an approval request: the first command action, else the
/// parsed `command`, else the raw params.
fn approval_command(params: &Value) -> String {
    if let Some(cmd) = params["commandActions"][0]["command"].as_str().filter(|c| !c.is_empty()) {
        return cmd.to_string();
    }
    let parsed = parse_cmd(&params["command"]);
    if !parsed.is_empty() {
        return parsed;
    }
    params.to_string()
}

fn error_message(error: &Value) -> String {
    error["message"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};
    use tokio::sync::mpsc;

    /// Scripted engine on the far side of a duplex pipe.
    struct FakeEngine {
        lines: Lines<BufReader<tokio::io::ReadHalf<DuplexStream>>>,
        out: tokio::io::WriteHalf<DuplexStream>,
    }

    impl FakeEngine {
        async fn recv(&mut self) -> Value {
            let line = self.lines.next_line().await.unwrap().expect("client closed");
            serde_json::from_str(&line).unwrap()
        }

        async fn send(&mut self, msg: Value) {
            self.send_raw(&format!("{msg}\n")).await;
        }

        /// The client may already have hung up; late writes are dropped.
        async fn send_raw(&mut self, raw: &str) {
            let _ = self.out.write_all(raw.as_bytes()).await;
        }

        /// Answer `initialize` and swallow `initialized`.
        async fn handshake(&mut self) {
            let init = self.recv().await;
            assert_eq!(init["method"], "initialize");
            assert_eq!(init["params"]["capabilities"]["experimentalApi"], true);
            self.send(json!({"id": init["id"], "result": {"userAgent": "fake"}})).await;
            assert_eq!(self.recv().await, json!({"method": "initialized"}));
        }
    }

    type Client = RpcConnection<BufReader<tokio::io::ReadHalf<DuplexStream>>, tokio::io::WriteHalf<DuplexStream>>;

    fn pipe() -> (Client, FakeEngine) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (cr, cw) = tokio::io::split(client);
        let (sr, sw) = tokio::io::split(server);
        let conn = RpcConnection::new(BufReader::new(cr), cw, 1024 * 1024);
        (conn, FakeEngine { lines: BufReader::new(sr).lines(), out: sw })
    }

    fn turn(session: Option<&str>) -> DriverTurn {
        DriverTurn {
            workspace: PathBuf::from("/srv/ws"),
            prompt: "list files".into(),
            session_id: session.map(str::to_string),
            tools: Vec::new(),
            policy: ApprovalPolicy::Never,
        }
    }

    async fn run_against<F, Fut>(turn: DriverTurn, script: F) -> (Result<(), DriverError>, Vec<TurnEvent>)
    where
        F: FnOnce(FakeEngine) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (mut conn, engine) = pipe();
        let server = tokio::spawn(script(engine));
        let config = AppServerConfig::default();
        let (sink, mut rx) = EventSink::channel(256);
        let cancel = CancellationToken::new();
        let result = {
            let mut session = ProtocolSession::new(&mut conn, &config, &sink, &cancel);
            session.run(&turn).await
        };
        drop(sink);
        drop(conn);
        server.await.unwrap();
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        (result, events)
    }

    fn drain(rx: &mut mpsc::Receiver<TurnEvent>) -> Vec<TurnEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    #[tokio::test]
    async fn full_turn_delivers_notifications_in_order() {
        let (result, events) = run_against(turn(None), |mut engine| async move {
            engine.handshake().await;
            let start = engine.recv().await;
            assert_eq!(start["method"], "thread/start");
            assert_eq!(start["params"]["cwd"], "/srv/ws");
            assert_eq!(start["params"]["approvalPolicy"], "never");
            assert_eq!(start["params"]["sandbox"], "danger-full-access");
            assert!(start["params"].get("threadId").is_none());
            assert!(start["params"].get("model").is_none());
            engine.send(json!({"method": "thread/started", "params": {"thread": {"id": "thr_1"}}})).await;
            engine.send(json!({"id": start["id"], "result": {"thread": {"id": "thr_1"}}})).await;

            let turn_start = engine.recv().await;
            assert_eq!(turn_start["method"], "turn/start");
            assert_eq!(turn_start["params"]["threadId"], "thr_1");
            assert_eq!(turn_start["params"]["input"], json!([{"type": "text", "text": "list files"}]));
            engine.send_raw("garbage line\n").await;
            engine.send(json!({"method": "item/started", "params": {"item": {"type": "commandExecution", "command": "bash -lc ls"}}})).await;
            // The response arrives mid-turn; reading continues until completion.
            engine.send(json!({"id": turn_start["id"], "result": {"turn": {"id": "t1"}}})).await;
            engine.send(json!({"method": "item/commandExecution/outputDelta", "params": {"delta": "a.txt"}})).await;
            engine.send(json!({"method": "item/agentMessage/delta", "params": {"delta": "One file."}})).await;
            engine.send(json!({"method": "turn/diff/updated", "params": {"diff": "diff --git a/a b/a"}})).await;
            engine.send(json!({"method": "thread/tokenUsage/updated", "params": {"tokenUsage": {"total": {"inputTokens": 5, "outputTokens": 1, "cachedInputTokens": 0}}}})).await;
            engine.send(json!({"method": "turn/completed", "params": {}})).await;
        })
        .await;

        result.unwrap();
        let types: Vec<&str> = events.iter().map(TurnEvent::event_type).collect();
        assert_eq!(types, vec!["session_id", "step", "step_data", "text", "diff", "usage"]);
        assert_eq!(events[0], TurnEvent::SessionId { session_id: "thr_1".into() });
        assert_eq!(events[1], TurnEvent::step("Bash(ls)"));
        assert_eq!(events[3], TurnEvent::text("One file."));
    }

    #[tokio::test]
    async fn resume_error_reports_expired_session() {
        let (result, events) = run_against(turn(Some("thr_old")), |mut engine| async move {
            engine.handshake().await;
            let resume = engine.recv().await;
            assert_eq!(resume["method"], "thread/resume");
            assert_eq!(resume["params"]["threadId"], "thr_old");
            assert!(resume["params"].get("cwd").is_none());
            engine.send(json!({"id": resume["id"], "error": {"code": -32600, "message": "no rollout found"}})).await;
        })
        .await;

        result.unwrap();
        assert_eq!(events, vec![TurnEvent::callout(CalloutStyle::Warning, SESSION_EXPIRED)]);
    }

    #[tokio::test]
    async fn missing_initialize_response_is_fatal() {
        let (result, events) = run_against(turn(None), |mut engine| async move {
            let init = engine.recv().await;
            assert_eq!(init["id"], 0);
        })
        .await;

        assert!(matches!(result, Err(DriverError::NoResponse(m)) if m == "initialize"));
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn approval_request_is_declined_and_stops_the_turn() {
        let (result, events) = run_against(turn(Some("thr_2")), |mut engine| async move {
            engine.handshake().await;
            let resume = engine.recv().await;
            engine.send(json!({"id": resume["id"], "result": {"thread": {"id": "thr_2"}}})).await;
            let start = engine.recv().await;
            engine.send(json!({"id": start["id"], "result": {}})).await;
            engine
                .send(json!({
                    "id": 41,
                    "method": "item/commandExecution/requestApproval",
                    "params": {"command": "/bin/bash -lc 'rm -rf build'", "cwd": "/srv/ws", "reason": "needs write access"}
                }))
                .await;
            let reply = engine.recv().await;
            assert_eq!(reply, json!({"id": 41, "result": {"decision": "decline"}}));
            // Anything after the decline is never read.
            engine.send(json!({"method": "item/agentMessage/delta", "params": {"delta": "late"}})).await;
        })
        .await;

        result.unwrap();
        assert_eq!(
            events,
            vec![
                TurnEvent::SessionId { session_id: "thr_2".into() },
                TurnEvent::Approval {
                    method: "item/commandExecution/requestApproval".into(),
                    command: "rm -rf build".into(),
                    cwd: Some("/srv/ws".into()),
                    reason: Some("needs write access".into()),
                },
                TurnEvent::PendingApproval {
                    action_type: "item/commandExecution/requestApproval".into(),
                    action_detail: Some("rm -rf build".into()),
                },
            ]
        );
    }

    #[tokio::test]
    async fn tool_call_requests_are_forwarded_and_acknowledged() {
        let (mut conn, mut engine) = pipe();
        let config = AppServerConfig::default();
        let (sink, mut rx) = EventSink::channel(16);
        let cancel = CancellationToken::new();

        let server = tokio::spawn(async move {
            let call = engine.recv().await;
            engine
                .send(json!({"id": "srv-1", "method": "item/tool/call", "params": {"tool": "render_chart", "arguments": "{\"kind\":\"bar\"}"}}))
                .await;
            let reply = engine.recv().await;
            assert_eq!(reply["id"], "srv-1");
            assert_eq!(reply["result"]["contentItems"][0]["text"], "render_chart rendered successfully");
            assert_eq!(reply["result"]["success"], true);
            engine.send(json!({"id": "srv-2", "method": "item/tool/call", "params": {"tool": "broken", "arguments": "{not json"}})).await;
            engine.recv().await;
            engine.send(json!({"id": "srv-3", "method": "account/chatgptAuthTokens/refresh"})).await;
            assert_eq!(engine.recv().await, json!({"id": "srv-3", "result": {"decision": "decline"}}));
            engine.send(json!({"id": call["id"], "result": {}})).await;
        });

        let mut session = ProtocolSession::new(&mut conn, &config, &sink, &cancel);
        let outcome = session.call("turn/start", None, false).await.unwrap();
        assert!(outcome.response.is_some());
        server.await.unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![
                TurnEvent::ToolCall { tool: "render_chart".into(), args: json!({"kind": "bar"}) },
                TurnEvent::ToolCall { tool: "broken".into(), args: json!({}) },
            ]
        );
    }

    #[tokio::test]
    async fn responses_for_other_ids_are_ignored() {
        let (mut conn, mut engine) = pipe();
        let config = AppServerConfig::default();
        let (sink, _rx) = EventSink::channel(16);
        let cancel = CancellationToken::new();

        let server = tokio::spawn(async move {
            let call = engine.recv().await;
            engine.send(json!({"id": 99, "result": {"stale": true}})).await;
            engine.send(json!({"id": call["id"], "result": {"fresh": true}})).await;
        });

        let mut session = ProtocolSession::new(&mut conn, &config, &sink, &cancel);
        let outcome = session.call("thread/start", None, false).await.unwrap();
        assert_eq!(outcome.result(), Some(&json!({"fresh": true})));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_interrupts_reads() {
        let (mut conn, _engine) = pipe();
        let config = AppServerConfig::default();
        let (sink, _rx) = EventSink::channel(16);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut session = ProtocolSession::new(&mut conn, &config, &sink, &cancel);
        let result = session.call("initialize", None, false).await;
        assert!(matches!(result, Err(DriverError::Cancelled)));
    }

    #[test]
    fn approval_command_fallbacks() {
        assert_eq!(
            approval_command(&json!({"commandActions": [{"command": "cargo test"}], "command": "bash -lc x"})),
            "cargo test"
        );
        assert_eq!(approval_command(&json!({"command": ["bash", "-lc", "make"]})), "make");
        assert_eq!(approval_command(&json!({"path": "x"})), r#"{"path":"x"}"#);
    }
}
