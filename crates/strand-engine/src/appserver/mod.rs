//! Driver for the subprocess engine (`codex app-server`).

pub mod rpc;
pub mod session;

use std::path::Path;
use std::process::Stdio;

use regex::Regex;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use strand_core::events::{EventSink, SinkClosed, TurnEvent};

use crate::config::AppServerConfig;
use rpc::RpcConnection;
pub use session::{DriverTurn, ProtocolSession, SESSION_EXPIRED};

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("failed to start engine: {0}")]
    Spawn(std::io::Error),

    #[error("engine i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no response to {0}")]
    NoResponse(String),

    #[error(transparent)]
    SinkClosed(#[from] SinkClosed),

    #[error("turn cancelled")]
    Cancelled,
}

type EngineConnection = RpcConnection<BufReader<ChildStdout>, ChildStdin>;

/// A running engine subprocess.
pub struct EngineProcess {
    child: Child,
    conn: EngineConnection,
    stderr: JoinHandle<String>,
}

impl EngineProcess {
    /// Close stdin, SIGTERM, wait up to `grace`, then kill. Returns everything
    /// the process wrote to stderr.
    async fn shutdown(self, grace: std::time::Duration) -> String {
        let EngineProcess { mut child, conn, stderr } = self;
        drop(conn);

        if matches!(child.try_wait(), Ok(None)) {
            terminate(&child);
            if tokio::time::timeout(grace, child.wait()).await.is_err() {
                warn!(grace_secs = grace.as_secs(), "engine ignored SIGTERM, killing");
                if let Err(e) = child.kill().await {
                    debug!(error = %e, "engine already exited");
                }
            }
        }

        match tokio::time::timeout(grace, stderr).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                debug!(error = %e, "stderr drain failed");
                String::new()
            }
            Err(_) => {
                warn!("stderr still open after shutdown");
                String::new()
            }
        }
    }
}

fn terminate(child: &Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: plain kill(2) on our own child.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

pub struct AppServerDriver {
    config: AppServerConfig,
    benign: Vec<Regex>,
}

impl AppServerDriver {
    pub fn new(config: AppServerConfig) -> Self {
        let benign = config
            .benign_stderr
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern = %pattern, error = %e, "matching benign stderr pattern literally");
                    Regex::new(&regex::escape(pattern)).ok()
                }
            })
            .collect();
        Self { config, benign }
    }

    pub fn config(&self) -> &AppServerConfig {
        &self.config
    }

    /// Spawn the engine in `workspace` with a cleared environment and
    /// `CODEX_HOME` pointing at `home`.
    pub fn start(&self, workspace: &Path, home: &Path) -> Result<EngineProcess, DriverError> {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .current_dir(workspace)
            .env_clear();
        for key in ["PATH", "HOME"] {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        cmd.env("NO_COLOR", "1")
            .env("CODEX_HOME", home)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(DriverError::Spawn)?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(DriverError::Spawn(std::io::Error::other("engine pipes unavailable")));
        };
        let stderr = child.stderr.take();
        let stderr = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(mut pipe) = stderr {
                if let Err(e) = pipe.read_to_end(&mut buf).await {
                    debug!(error = %e, "stderr closed early");
                }
            }
            String::from_utf8_lossy(&buf).into_owned()
        });
        debug!(pid = ?child.id(), program = %self.config.program, "engine started");

        let conn = RpcConnection::new(BufReader::new(stdout), stdin, self.config.max_line_bytes);
        Ok(EngineProcess { child, conn, stderr })
    }

    /// Diagnostic text worth reporting: benign lines removed, trimmed.
    pub fn filter_stderr(&self, stderr: &str) -> String {
        stderr
            .lines()
            .filter(|line| !self.benign.iter().any(|re| re.is_match(line)))
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    }

    /// Run one turn in a fresh engine process. Engine failures are reported as
    /// callouts on `sink`; the process is always shut down before returning.
    #[instrument(skip_all, fields(workspace = %turn.workspace.display()))]
    pub async fn run_turn(
        &self,
        turn: &DriverTurn,
        home: &Path,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<(), DriverError> {
        let mut process = self.start(&turn.workspace, home)?;
        let result = {
            let mut session = ProtocolSession::new(&mut process.conn, &self.config, sink, cancel);
            session.run(turn).await
        };
        let stderr = self.filter_stderr(&process.shutdown(self.config.shutdown_grace()).await);

        match result {
            Ok(()) => info!("engine turn finished"),
            Err(e @ (DriverError::Cancelled | DriverError::SinkClosed(_))) => return Err(e),
            Err(DriverError::NoResponse(method)) if method == "initialize" => {
                sink.emit(TurnEvent::error(format!("init failed: {stderr}"))).await?;
                return Ok(());
            }
            Err(e) => {
                warn!(error = %e, "engine turn failed");
                sink.emit(TurnEvent::error(e.to_string())).await?;
            }
        }
        if !stderr.is_empty() {
            sink.emit(TurnEvent::error(stderr)).await?;
        }
        Ok(())
    }
}
