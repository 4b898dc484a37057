use std::path::Path;
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::{SandboxConfig, SandboxMode};
use crate::truncate::truncate_output;

const NO_OUTPUT: &str = "(no output)";

/// Runs shell commands confined to a workspace.
#[derive(Clone, Debug)]
pub struct Sandbox {
    config: SandboxConfig,
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn mount_point(&self) -> &Path {
        &self.config.mount_point
    }

    /// Run `bash -c <script>` and return its combined output. Every failure is
    /// reported in the returned text; the exit status is not.
    #[instrument(skip_all, fields(mode = ?self.config.mode))]
    pub async fn exec_bash(&self, script: &str, workspace: &Path, cancel: &CancellationToken) -> String {
        let mut child = match self.command(script, workspace).spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(error = %e, "failed to spawn sandboxed command");
                return format!("Error: failed to start command: {e}");
            }
        };

        let pgid = child.id();
        let mut stdout = tokio::spawn(read_all(child.stdout.take()));
        let mut stderr = tokio::spawn(read_all(child.stderr.take()));

        let timeout = self.config.bash_timeout();
        let deadline = tokio::time::Instant::now() + timeout;
        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = tokio::time::sleep_until(deadline) => Outcome::TimedOut,
            _ = cancel.cancelled() => Outcome::Cancelled,
        };

        match outcome {
            Outcome::Exited(status) => {
                match status {
                    Ok(status) => debug!(code = ?status.code(), "command exited"),
                    Err(e) => warn!(error = %e, "failed to wait for command"),
                }
                // Background jobs would otherwise hold the pipes open.
                signal_group(pgid);
                let drained = tokio::time::timeout_at(deadline, async {
                    let mut combined = (&mut stdout).await.unwrap_or_default();
                    combined.extend((&mut stderr).await.unwrap_or_default());
                    combined
                })
                .await;
                match drained {
                    Ok(combined) => format_output(&combined),
                    Err(_) => {
                        warn!(timeout_secs = self.config.bash_timeout, "command output still open at timeout");
                        stdout.abort();
                        stderr.abort();
                        format!("Error: command timed out after {}s", self.config.bash_timeout)
                    }
                }
            }
            Outcome::TimedOut => {
                warn!(timeout_secs = self.config.bash_timeout, "command timed out");
                kill_group(&mut child, pgid).await;
                stdout.abort();
                stderr.abort();
                format!("Error: command timed out after {}s", self.config.bash_timeout)
            }
            Outcome::Cancelled => {
                kill_group(&mut child, pgid).await;
                stdout.abort();
                stderr.abort();
                "Error: command cancelled".to_string()
            }
        }
    }

    fn command(&self, script: &str, workspace: &Path) -> Command {
        let mut cmd = match self.config.mode {
            SandboxMode::Bubblewrap => {
                let mount = &self.config.mount_point;
                let mut cmd = Command::new(&self.config.bwrap_path);
                cmd.args(["--ro-bind", "/", "/"])
                    .arg("--bind")
                    .arg(workspace)
                    .arg(mount)
                    .args(["--dev", "/dev", "--proc", "/proc", "--tmpfs", "/tmp"])
                    .args(["--unshare-all", "--share-net", "--die-with-parent", "--new-session"])
                    .arg("--chdir")
                    .arg(mount)
                    .args(["bash", "-c", script]);
                cmd
            }
            SandboxMode::Unconfined => {
                let mut cmd = Command::new("bash");
                cmd.arg("-c").arg(script).current_dir(workspace);
                cmd
            }
        };

        let home = match self.config.mode {
            SandboxMode::Bubblewrap => self.config.mount_point.as_path(),
            SandboxMode::Unconfined => workspace,
        };
        cmd.env_clear();
        for key in &self.config.env_allowlist {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        cmd.env("HOME", home)
            .env("TERM", &self.config.term)
            .env("LANG", &self.config.lang)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

async fn read_all<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(e) = pipe.read_to_end(&mut buf).await {
            debug!(error = %e, "output pipe closed early");
        }
    }
    buf
}

/// SIGKILL the process group led by `pgid`.
fn signal_group(pgid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pgid {
        // SAFETY: signalling a process group we created; a stale id only yields ESRCH.
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pgid;
}

/// Kill the command's whole process group, then reap it.
async fn kill_group(child: &mut Child, pgid: Option<u32>) {
    signal_group(pgid);
    if let Err(e) = child.kill().await {
        debug!(error = %e, "command already gone");
    }
}

/// Lossy-decode, cap the size, trim, and substitute a placeholder for silence.
pub fn format_output(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let text = truncate_output(&text);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        NO_OUTPUT.to_string()
    } else {
        trimmed.to_string()
    }
}
