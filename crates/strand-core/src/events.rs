use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::DropGuard;

use crate::tokens::UsageReport;

/// Canonical events emitted to the caller, whichever engine drives the turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        done: Option<bool>,
    },
    Step {
        step: String,
    },
    StepData {
        data: String,
    },
    ToolCall {
        tool: String,
        args: Value,
    },
    Approval {
        method: String,
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    PendingApproval {
        action_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        action_detail: Option<String>,
    },
    Diff {
        diff: String,
    },
    Usage {
        usage: UsageReport,
    },
    SessionId {
        session_id: String,
    },
    Callout {
        callout: String,
        style: CalloutStyle,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    Status {
        status: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalloutStyle {
    Info,
    Warning,
    Error,
    Success,
}

impl TurnEvent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn step(step: impl Into<String>) -> Self {
        Self::Step { step: step.into() }
    }

    pub fn thinking(thinking: impl Into<String>) -> Self {
        Self::Thinking { thinking: thinking.into(), done: None }
    }

    pub fn callout(style: CalloutStyle, callout: impl Into<String>) -> Self {
        Self::Callout { callout: callout.into(), style, title: None }
    }

    pub fn error(callout: impl Into<String>) -> Self {
        Self::callout(CalloutStyle::Error, callout)
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Thinking { .. } => "thinking",
            Self::Step { .. } => "step",
            Self::StepData { .. } => "step_data",
            Self::ToolCall { .. } => "tool_call",
            Self::Approval { .. } => "approval",
            Self::PendingApproval { .. } => "pending_approval",
            Self::Diff { .. } => "diff",
            Self::Usage { .. } => "usage",
            Self::SessionId { .. } => "session_id",
            Self::Callout { .. } => "callout",
            Self::Status { .. } => "status",
        }
    }
}

/// Inbound form of an event: a bare string is shorthand for `text`.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum WireEvent {
    Shorthand(String),
    Event(TurnEvent),
}

impl From<WireEvent> for TurnEvent {
    fn from(wire: WireEvent) -> Self {
        match wire {
            WireEvent::Shorthand(text) => TurnEvent::Text { text },
            WireEvent::Event(event) => event,
        }
    }
}

/// The receiving side went away; the turn should stop producing.
#[derive(Clone, Copy, Debug, thiserror::Error)]
#[error("event receiver closed")]
pub struct SinkClosed;

/// Ordered, lossless event delivery into a bounded channel.
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: mpsc::Sender<TurnEvent>,
}

impl EventSink {
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<TurnEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }

    pub async fn emit(&self, event: TurnEvent) -> Result<(), SinkClosed> {
        self.tx.send(event).await.map_err(|_| SinkClosed)
    }

    pub async fn emit_all(
        &self,
        events: impl IntoIterator<Item = TurnEvent>,
    ) -> Result<(), SinkClosed> {
        for event in events {
            self.emit(event).await?;
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pin_project_lite::pin_project! {
    /// The caller's view of a running turn. Dropping it cancels the turn.
    pub struct TurnEvents {
        #[pin]
        inner: ReceiverStream<TurnEvent>,
        _guard: DropGuard,
    }
}

impl TurnEvents {
    pub fn new(rx: mpsc::Receiver<TurnEvent>, guard: DropGuard) -> Self {
        Self {
            inner: ReceiverStream::new(rx),
            _guard: guard,
        }
    }
}

impl Stream for TurnEvents {
    type Item = TurnEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().inner.poll_next(cx)
    }
}
