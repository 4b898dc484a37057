use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use strand_core::approval::{resolve_pending, ApprovalPolicy, PendingApproval};
use strand_core::events::{EventSink, SinkClosed, TurnEvent, TurnEvents};
use strand_core::ids::SessionId;
use strand_core::messages::Message;
use strand_core::provider::LlmProvider;
use strand_core::tokens::UsageReport;
use strand_core::tools::{CustomToolSpec, ToolContext};
use strand_store::compaction::persist_turn;
use strand_store::{history, history_path, SessionLocks};

use crate::appserver::{AppServerDriver, DriverError, DriverTurn};
use crate::config::OrchestratorConfig;
use crate::error::EngineError;
use crate::runner::{RunOutcome, RunParams, StreamingRunner};
use crate::sandbox::Sandbox;
use crate::snapshot::WorkspaceSnapshot;
use crate::tools::create_default_registry;
use crate::workspace::{copy_uploads, prepare_engine_home};

/// Which reasoning engine serves a turn.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Remote streaming API with the local tool-use loop.
    #[default]
    Streaming,
    /// `codex app-server` subprocess.
    AppServer,
}

/// One inbound turn.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TurnRequest {
    pub workspace: PathBuf,
    pub prompt: String,
    #[serde(default)]
    pub backend: Backend,
    #[serde(default)]
    pub policy: ApprovalPolicy,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub pending: Option<PendingApproval>,
    #[serde(default)]
    pub tools: Vec<CustomToolSpec>,
    /// Names relative to the configured upload root.
    #[serde(default)]
    pub uploads: Vec<String>,
}

impl TurnRequest {
    pub fn new(workspace: impl Into<PathBuf>, prompt: impl Into<String>) -> Self {
        Self {
            workspace: workspace.into(),
            prompt: prompt.into(),
            backend: Backend::default(),
            policy: ApprovalPolicy::default(),
            session_id: None,
            pending: None,
            tools: Vec::new(),
            uploads: Vec::new(),
        }
    }
}

/// Entry point: runs turns on either backend and hands back their events.
#[derive(Clone)]
pub struct TurnController {
    inner: Arc<Inner>,
}

struct Inner {
    config: OrchestratorConfig,
    provider: Arc<dyn LlmProvider>,
    sandbox: Sandbox,
    driver: AppServerDriver,
    locks: SessionLocks,
}

impl TurnController {
    pub fn new(config: OrchestratorConfig, provider: Arc<dyn LlmProvider>) -> Self {
        let sandbox = Sandbox::new(config.sandbox.clone());
        let driver = AppServerDriver::new(config.app_server.clone());
        Self {
            inner: Arc::new(Inner { config, provider, sandbox, driver, locks: SessionLocks::new() }),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Start a turn in the background. The turn is cancelled when the
    /// returned stream is dropped. Must be called inside a tokio runtime.
    pub fn run_turn(&self, request: TurnRequest) -> TurnEvents {
        let (sink, rx) = EventSink::channel(self.inner.config.event_buffer.max(1));
        let cancel = CancellationToken::new();
        let inner = Arc::clone(&self.inner);
        let token = cancel.clone();
        tokio::spawn(async move {
            inner.drive(request, &sink, &token).await;
            inner.locks.prune();
        });
        TurnEvents::new(rx, cancel.drop_guard())
    }
}

impl Inner {
    async fn drive(&self, request: TurnRequest, sink: &EventSink, cancel: &CancellationToken) {
        let backend = request.backend;
        let result = match backend {
            Backend::Streaming => self.run_streaming(request, sink, cancel).await,
            Backend::AppServer => self.run_app_server(request, sink, cancel).await,
        };
        match result {
            Ok(()) => info!(?backend, "turn finished"),
            Err(e) if e.is_silent() => debug!(?backend, error = %e, "turn ended without a listener"),
            Err(e) => {
                warn!(?backend, error = %e, "turn failed");
                if sink.emit(TurnEvent::error(e.to_string())).await.is_err() {
                    debug!("caller gone before the error callout");
                }
            }
        }
    }

    /// Resolve a pending approval and announce uploads.
    async fn prepare_prompt(&self, request: &TurnRequest) -> (String, ApprovalPolicy) {
        let (mut prompt, policy) = resolve_pending(request.pending.as_ref(), &request.prompt, request.policy);
        if let Some(root) = self.config.upload_root.clone() {
            if !request.uploads.is_empty() {
                let names = request.uploads.clone();
                let workspace = request.workspace.clone();
                match tokio::task::spawn_blocking(move || copy_uploads(&root, &names, &workspace)).await {
                    Ok(suffix) => prompt.push_str(&suffix),
                    Err(e) => warn!(error = %e, "upload copy failed"),
                }
            }
        }
        (prompt, policy)
    }

    #[instrument(skip_all, fields(workspace = %request.workspace.display()))]
    async fn run_streaming(
        &self,
        request: TurnRequest,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let (prompt, policy) = self.prepare_prompt(&request).await;

        let session_id = match request.session_id.as_deref().filter(|id| !id.is_empty()) {
            Some(id) => SessionId::from_raw(id),
            None => {
                let id = SessionId::new();
                sink.emit(TurnEvent::SessionId { session_id: id.as_str().to_string() }).await?;
                id
            }
        };
        let path = history_path(&request.workspace, &self.config.state_dir, &session_id)?;

        let _lock = tokio::select! {
            guard = self.locks.acquire(&path) => guard,
            _ = cancel.cancelled() => return Err(EngineError::Aborted),
        };

        let prior = history::load(&path).await;
        let mut messages = prior.clone();
        messages.push(Message::user_text(prompt));
        let before = self.snapshot(&request.workspace).await;

        let registry = Arc::new(create_default_registry(&self.sandbox, &request.tools));
        let runner = StreamingRunner::new(Arc::clone(&self.provider), registry, self.config.streaming.clone());
        let params = RunParams {
            tool_ctx: ToolContext {
                session_id: session_id.clone(),
                workspace: request.workspace.clone(),
                abort_signal: cancel.clone(),
            },
            policy,
            sink,
        };
        let result = runner.run(&mut messages, &params).await;
        let new_messages = &messages[prior.len()..];

        match result {
            Ok(outcome) => {
                let reported = self.report(&before, &request.workspace, &outcome, sink).await;
                let persisted = persist_turn(
                    &path,
                    &prior,
                    new_messages,
                    outcome.usage.input_tokens,
                    &self.config.streaming.compaction(),
                    self.provider.as_ref(),
                )
                .await?;
                debug!(session_id = %session_id, ?persisted, "history saved");
                reported.map_err(Into::into)
            }
            Err(e) => {
                if let Err(store) = history::append(&path, new_messages).await {
                    warn!(session_id = %session_id, error = %store, "failed to save history after error");
                }
                Err(e)
            }
        }
    }

    /// Workspace diff (when anything changed) followed by usage.
    async fn report(
        &self,
        before: &WorkspaceSnapshot,
        workspace: &Path,
        outcome: &RunOutcome,
        sink: &EventSink,
    ) -> Result<(), SinkClosed> {
        let after = self.snapshot(workspace).await;
        let diff = before.diff(&after);
        if !diff.is_empty() {
            sink.emit(TurnEvent::Diff { diff }).await?;
        }
        sink.emit(TurnEvent::Usage { usage: UsageReport::from_total(outcome.usage.clone()) }).await
    }

    async fn snapshot(&self, workspace: &Path) -> WorkspaceSnapshot {
        let root = workspace.to_path_buf();
        let state_dir = self.config.state_dir.clone();
        match tokio::task::spawn_blocking(move || WorkspaceSnapshot::capture(&root, &state_dir)).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "workspace snapshot failed");
                WorkspaceSnapshot::default()
            }
        }
    }

    #[instrument(skip_all, fields(workspace = %request.workspace.display()))]
    async fn run_app_server(
        &self,
        request: TurnRequest,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let (workspace, state_dir, setup) =
            (request.workspace.clone(), self.config.state_dir.clone(), self.config.workspace.clone());
        let home = tokio::task::spawn_blocking(move || prepare_engine_home(&workspace, &state_dir, &setup))
            .await
            .map_err(|e| EngineError::Internal(format!("failed to prepare workspace: {e}")))?
            .map_err(|e| EngineError::Internal(format!("failed to prepare workspace: {e}")))?;
        let (prompt, policy) = self.prepare_prompt(&request).await;
        let turn = DriverTurn {
            workspace: request.workspace,
            prompt,
            session_id: request.session_id.filter(|id| !id.is_empty()),
            tools: request.tools,
            policy,
        };
        match self.driver.run_turn(&turn, &home, sink, cancel).await {
            Ok(()) => Ok(()),
            Err(DriverError::Cancelled) => Err(EngineError::Aborted),
            Err(DriverError::SinkClosed(closed)) => Err(closed.into()),
            Err(e) => Err(EngineError::Protocol(e.to_string())),
        }
    }
}
