use std::io;
use std::path::{Path, PathBuf};

use serde_json::json;
use tracing::{debug, warn};

use crate::config::WorkspaceSetup;

/// Write the subprocess engine's home under `<workspace>/<state_dir>` and
/// return its path. An existing `auth.json` is never replaced.
pub fn prepare_engine_home(workspace: &Path, state_dir: &str, setup: &WorkspaceSetup) -> io::Result<PathBuf> {
    let home = workspace.join(state_dir);
    std::fs::create_dir_all(&home)?;

    if let Some(instructions) = setup.instructions.as_deref().filter(|s| !s.is_empty()) {
        let path = home.join("instructions.md");
        std::fs::write(&path, instructions)?;
        let quoted = serde_json::to_string(&path.to_string_lossy())?;
        std::fs::write(home.join("config.toml"), format!("model_instructions_file = {quoted}\n"))?;
    }

    let auth = home.join("auth.json");
    if !auth.exists() {
        let key = setup.openai_api_key.as_deref().unwrap_or_default();
        let body = json!({"auth_mode": "apikey", "OPENAI_API_KEY": key});
        std::fs::write(&auth, serde_json::to_vec(&body)?)?;
    }

    if let Some(agents) = setup.agent_instructions.as_deref().filter(|s| !s.is_empty()) {
        std::fs::write(workspace.join("AGENTS.md"), agents)?;
    }
    Ok(home)
}

/// Copy uploads from `root` into the workspace and return the prompt suffix
/// announcing them. Names that resolve outside `root` are skipped.
pub fn copy_uploads(root: &Path, names: &[String], workspace: &Path) -> String {
    let Ok(root) = root.canonicalize() else {
        warn!("upload root is not accessible");
        return String::new();
    };
    let mut suffix = String::new();
    for name in names {
        let relative = name.trim_start_matches('/');
        let source = match root.join(relative).canonicalize() {
            Ok(source) if source.starts_with(&root) && source.is_file() => source,
            _ => {
                warn!(upload = %name, "skipping upload outside the upload root");
                continue;
            }
        };
        let Some(file_name) = source.file_name() else {
            continue;
        };
        match std::fs::copy(&source, workspace.join(file_name)) {
            Ok(bytes) => {
                debug!(upload = %name, bytes, "copied upload");
                suffix.push_str(&format!(" [USER UPLOADED {}]", file_name.to_string_lossy()));
            }
            Err(e) => warn!(upload = %name, error = %e, "failed to copy upload"),
        }
    }
    suffix
}
