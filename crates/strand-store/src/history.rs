use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::instrument;

use strand_core::ids::SessionId;
use strand_core::messages::Message;

use crate::error::StoreError;

/// Directory under each workspace holding per-session state.
pub const DEFAULT_STATE_DIR: &str = ".strand";

/// `<workspace>/<state_dir>/history_<session>.jsonl`, refusing ids that could
/// escape the state directory.
pub fn history_path(workspace: &Path, state_dir: &str, session: &SessionId) -> Result<PathBuf, StoreError> {
    if !session.is_path_safe() {
        return Err(StoreError::InvalidSession(session.to_string()));
    }
    Ok(workspace.join(state_dir).join(format!("history_{session}.jsonl")))
}

/// Read a transcript. A missing or unreadable file is an empty history and
/// corrupt lines are skipped. The returned messages carry exactly one cache
/// marker, on the final block of the last message.
#[instrument(skip_all, fields(path = %path.display()))]
pub async fn load(path: &Path) -> Vec<Message> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            tracing::warn!(error = %e, "history unreadable, starting empty");
            return Vec::new();
        }
    };

    let text = String::from_utf8_lossy(&bytes);
    let mut messages = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Message>(line) {
            Ok(msg) => messages.push(msg),
            Err(e) => tracing::warn!(line = lineno + 1, error = %e, "skipping corrupt history line"),
        }
    }

    for msg in &mut messages {
        msg.strip_cache_control();
    }
    if let Some(last) = messages.last_mut() {
        last.mark_cache_boundary();
    }
    messages
}

fn encode(messages: &[Message]) -> Result<Vec<u8>, StoreError> {
    let mut buf = Vec::new();
    for msg in messages {
        let mut msg = msg.clone();
        msg.strip_cache_control();
        serde_json::to_writer(&mut buf, &msg)?;
        buf.push(b'\n');
    }
    Ok(buf)
}

/// Append messages with a single write so a crash never leaves half a batch.
#[instrument(skip_all, fields(path = %path.display(), count = messages.len()))]
pub async fn append(path: &Path, messages: &[Message]) -> Result<(), StoreError> {
    if messages.is_empty() {
        return Ok(());
    }
    let buf = encode(messages)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(&buf).await?;
    file.flush().await?;
    Ok(())
}

/// Replace the whole transcript through a temp file renamed into place.
#[instrument(skip_all, fields(path = %path.display(), count = messages.len()))]
pub async fn overwrite(path: &Path, messages: &[Message]) -> Result<(), StoreError> {
    let buf = encode(messages)?;
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || write_atomic(&path, &buf))
        .await
        .map_err(|e| StoreError::Io(format!("overwrite task failed: {e}")))?
}

fn write_atomic(path: &Path, buf: &[u8]) -> Result<(), StoreError> {
    use std::io::Write;

    let dir = path
        .parent()
        .ok_or_else(|| StoreError::Io(format!("{} has no parent directory", path.display())))?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(buf)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)?;
    Ok(())
}
