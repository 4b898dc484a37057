//! Agent turn orchestration: drive one conversational turn against either a
//! `codex app-server` subprocess or the streaming Messages API, run the tools
//! it asks for in a sandbox, and hand back one canonical event stream.
//!
//! ```no_run
//! use std::sync::Arc;
//! use futures::StreamExt;
//! use strand::prelude::*;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = AnthropicProvider::new(ProviderConfig::from_env())?;
//! let controller = TurnController::new(OrchestratorConfig::default(), Arc::new(provider));
//! let mut events = controller.run_turn(TurnRequest::new("/srv/ws/demo", "list files"));
//! while let Some(event) = events.next().await {
//!     println!("{}", serde_json::to_string(&event)?);
//! }
//! # Ok(())
//! # }
//! ```

pub use strand_core as core;
pub use strand_engine as engine;
pub use strand_llm as llm;
pub use strand_store as store;
pub use strand_telemetry as telemetry;

pub mod prelude {
    pub use strand_core::approval::{ApprovalPolicy, PendingApproval};
    pub use strand_core::events::{CalloutStyle, TurnEvent, TurnEvents};
    pub use strand_core::provider::LlmProvider;
    pub use strand_core::tools::CustomToolSpec;
    pub use strand_engine::{Backend, EngineError, OrchestratorConfig, TurnController, TurnRequest};
    pub use strand_llm::{AnthropicProvider, ProviderConfig};
    pub use strand_telemetry::{init_telemetry, TelemetryConfig, TelemetryGuard};
}
