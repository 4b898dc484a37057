use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use strand_core::provider::{StreamOptions, ThinkingConfig};
use strand_store::{CompactionConfig, DEFAULT_STATE_DIR};

/// How bash commands are isolated from the host.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxMode {
    #[default]
    Bubblewrap,
    /// No namespaces; same environment filtering, cwd is the workspace.
    Unconfined,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub mode: SandboxMode,
    pub bwrap_path: PathBuf,
    /// Where the workspace appears inside the sandbox.
    pub mount_point: PathBuf,
    /// Seconds before a bash command is killed.
    pub bash_timeout: u64,
    /// Host variables passed through to the command.
    pub env_allowlist: Vec<String>,
    pub term: String,
    pub lang: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            mode: SandboxMode::Bubblewrap,
            bwrap_path: PathBuf::from("bwrap"),
            mount_point: PathBuf::from("/workspace"),
            bash_timeout: 300,
            env_allowlist: vec!["PATH".into()],
            term: "xterm-256color".into(),
            lang: "C.UTF-8".into(),
        }
    }
}

impl SandboxConfig {
    pub fn unconfined() -> Self {
        Self { mode: SandboxMode::Unconfined, ..Self::default() }
    }

    pub fn bash_timeout(&self) -> Duration {
        Duration::from_secs(self.bash_timeout)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Overrides the provider's model when set.
    pub model: Option<String>,
    pub max_tokens: u32,
    /// Extended thinking budget; 0 disables thinking.
    pub thinking_budget: u32,
    pub system: Option<String>,
    pub compaction_threshold: u64,
    pub max_steps: u32,
    /// Seconds a single tool invocation may run.
    pub tool_timeout: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            model: None,
            max_tokens: 16_384,
            thinking_budget: 10_000,
            system: None,
            compaction_threshold: 150_000,
            max_steps: 50,
            tool_timeout: 600,
        }
    }
}

impl StreamingConfig {
    pub fn stream_options(&self) -> StreamOptions {
        let thinking = if self.thinking_budget == 0 {
            ThinkingConfig::Disabled
        } else {
            ThinkingConfig::Budget { tokens: self.thinking_budget }
        };
        StreamOptions {
            max_tokens: self.max_tokens,
            thinking,
            stop_sequences: Vec::new(),
        }
    }

    pub fn compaction(&self) -> CompactionConfig {
        CompactionConfig {
            threshold: self.compaction_threshold,
            ..CompactionConfig::default()
        }
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AppServerConfig {
    pub program: String,
    pub args: Vec<String>,
    pub client_name: String,
    pub client_version: String,
    /// Sandbox mode requested from the engine on thread start/resume.
    pub sandbox_mode: String,
    pub model: Option<String>,
    /// Reasoning effort passed on `turn/start`.
    pub effort: Option<String>,
    /// Seconds between SIGTERM and a forced kill.
    pub shutdown_grace: u64,
    /// Regexes for diagnostic lines that are not worth reporting.
    pub benign_stderr: Vec<String>,
    /// Longest protocol line accepted; longer lines are skipped.
    pub max_line_bytes: usize,
}

impl Default for AppServerConfig {
    fn default() -> Self {
        Self {
            program: "codex".into(),
            args: vec!["app-server".into()],
            client_name: "strand".into(),
            client_version: env!("CARGO_PKG_VERSION").into(),
            sandbox_mode: "danger-full-access".into(),
            model: None,
            effort: None,
            shutdown_grace: 5,
            benign_stderr: vec!["state db missing rollout".into()],
            max_line_bytes: 10 * 1024 * 1024,
        }
    }
}

impl AppServerConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace)
    }
}

/// Files written into the engine home before a subprocess turn.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct WorkspaceSetup {
    /// Model instructions, written to `instructions.md` and referenced from `config.toml`.
    pub instructions: Option<String>,
    /// Written to `AGENTS.md` at the workspace root.
    pub agent_instructions: Option<String>,
    /// Stored in `auth.json` unless one already exists.
    pub openai_api_key: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub state_dir: String,
    pub sandbox: SandboxConfig,
    pub streaming: StreamingConfig,
    pub app_server: AppServerConfig,
    pub workspace: WorkspaceSetup,
    /// Directory uploads are copied from.
    pub upload_root: Option<PathBuf>,
    /// Capacity of the per-turn event channel.
    pub event_buffer: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            state_dir: DEFAULT_STATE_DIR.into(),
            sandbox: SandboxConfig::default(),
            streaming: StreamingConfig::default(),
            app_server: AppServerConfig::default(),
            workspace: WorkspaceSetup::default(),
            upload_root: None,
            event_buffer: 256,
        }
    }
}
