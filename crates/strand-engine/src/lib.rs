pub mod appserver;
pub mod config;
pub mod controller;
pub mod error;
pub mod registry;
pub mod runner;
pub mod sandbox;
pub mod snapshot;
pub mod tools;
pub mod translate;
pub mod truncate;
pub mod workspace;

pub use appserver::{AppServerDriver, DriverError, DriverTurn};
pub use config::{AppServerConfig, OrchestratorConfig, SandboxConfig, SandboxMode, StreamingConfig, WorkspaceSetup};
pub use controller::{Backend, TurnController, TurnRequest};
pub use error::EngineError;
pub use registry::{ToolRegistry, ToolSource};
pub use runner::{RunOutcome, RunParams, StreamingRunner};
pub use sandbox::Sandbox;
