use std::path::{Component, Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use base64::Engine as _;
use serde_json::Value;

use strand_core::messages::{InlineContent, MediaSource, ToolResultContent};
use strand_core::tools::{Tool, ToolContext, ToolDefinition, ToolError, ToolResult};

pub const EDITOR_TOOL_NAME: &str = "str_replace_based_edit_tool";
const EDITOR_TOOL_TYPE: &str = "text_editor_20250728";

/// The engine's built-in file editor, confined to the workspace.
pub struct EditorTool {
    mount_point: PathBuf,
}

impl EditorTool {
    pub fn new(mount_point: impl Into<PathBuf>) -> Self {
        Self { mount_point: mount_point.into() }
    }
}

#[async_trait]
impl Tool for EditorTool {
    fn name(&self) -> &str {
        EDITOR_TOOL_NAME
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::builtin(EDITOR_TOOL_NAME, EDITOR_TOOL_TYPE)
    }

    fn describe(&self, args: &Value) -> String {
        let path = args["path"].as_str().filter(|p| !p.is_empty()).unwrap_or("file");
        match args["command"].as_str() {
            Some("str_replace" | "create" | "insert") => format!("Editing {path}"),
            _ => format!("Viewing {path}"),
        }
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let start = Instant::now();
        let workspace = ctx.workspace.clone();
        let mount_point = self.mount_point.clone();
        let content = tokio::task::spawn_blocking(move || exec_editor(&args, &workspace, &mount_point))
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("editor task failed: {e}")))?;
        let is_error = matches!(&content, ToolResultContent::Text(t) if t.starts_with("Error:"));
        Ok(ToolResult { content, is_error, duration: start.elapsed() })
    }
}

fn text(s: impl Into<String>) -> ToolResultContent {
    ToolResultContent::Text(s.into())
}

/// Run one editor command. Failures come back as `Error: ...` text that never
/// names a host path.
pub fn exec_editor(args: &Value, workspace: &Path, mount_point: &Path) -> ToolResultContent {
    let Some(command) = args["command"].as_str() else {
        return text("Error: missing required parameter command");
    };
    let Some(arg) = args["path"].as_str() else {
        return text("Error: missing required parameter path");
    };
    let path = match resolve_path(arg, workspace, mount_point) {
        Ok(path) => path,
        Err(e) => return text(e),
    };
    let result = match command {
        "view" => view(&path, arg, args),
        "str_replace" => str_replace(&path, arg, args),
        "create" => create(&path, arg, args),
        "insert" => insert(&path, arg, args),
        other => Err(format!("Error: unknown command {other}")),
    };
    result.unwrap_or_else(text)
}

/// Map `arg` onto the workspace and require the canonical result to stay inside it.
pub fn resolve_path(arg: &str, workspace: &Path, mount_point: &Path) -> Result<PathBuf, String> {
    let outside = || format!("Error: path {arg} is outside workspace");
    let root = workspace.canonicalize().map_err(|_| outside())?;

    let raw = Path::new(arg);
    let host_path = raw.is_absolute() && (raw.starts_with(&root) || raw.starts_with(workspace));
    let joined = if host_path {
        raw.to_path_buf()
    } else if let Ok(rest) = raw.strip_prefix(mount_point) {
        root.join(rest)
    } else if raw.is_absolute() {
        raw.to_path_buf()
    } else {
        root.join(raw)
    };
    let normalized = normalize(&joined).ok_or_else(outside)?;
    let resolved = canonicalize_existing(&normalized).ok_or_else(outside)?;
    if resolved.starts_with(&root) {
        Ok(resolved)
    } else {
        Err(outside())
    }
}

/// Lexically fold `.` and `..`; `None` when `..` climbs above the root.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    Some(out)
}

/// Canonicalize the deepest existing ancestor and re-attach the missing tail.
fn canonicalize_existing(path: &Path) -> Option<PathBuf> {
    let mut existing = path;
    let mut tail = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            let mut out = canonical;
            out.extend(tail.iter().rev());
            return Some(out);
        }
        tail.push(existing.file_name()?.to_owned());
        existing = existing.parent()?;
    }
}

fn required<'a>(args: &'a Value, key: &str) -> Result<&'a str, String> {
    args[key]
        .as_str()
        .ok_or_else(|| format!("Error: missing required parameter {key}"))
}

fn media_type(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "pdf" => Some("application/pdf"),
        _ => None,
    }
}

fn view(path: &Path, arg: &str, args: &Value) -> Result<ToolResultContent, String> {
    if !path.exists() {
        return Err(format!("Error: {arg} does not exist"));
    }
    if path.is_dir() {
        return list_dir(path, arg).map(text);
    }
    let bytes = std::fs::read(path).map_err(|e| format!("Error: cannot read {arg}: {}", e.kind()))?;

    if let Some(media) = media_type(path) {
        let source = MediaSource::base64(media, base64::engine::general_purpose::STANDARD.encode(&bytes));
        let block = if media == "application/pdf" {
            InlineContent::Document { source }
        } else {
            InlineContent::Image { source }
        };
        return Ok(ToolResultContent::Blocks(vec![block]));
    }

    let contents = String::from_utf8(bytes).map_err(|_| format!("Error: {arg} is a binary file"))?;
    let lines: Vec<&str> = contents.lines().collect();
    let (start, end) = view_window(args, lines.len())?;
    let numbered: Vec<String> = lines
        .iter()
        .enumerate()
        .skip(start)
        .take(end.saturating_sub(start))
        .map(|(i, line)| format!("{:>6}\t{line}", i + 1))
        .collect();
    Ok(text(numbered.join("\n")))
}

/// Zero-based half-open line window from `view_range`.
fn view_window(args: &Value, len: usize) -> Result<(usize, usize), String> {
    let Some(range) = args.get("view_range").filter(|v| !v.is_null()) else {
        return Ok((0, len));
    };
    let bounds = range
        .as_array()
        .filter(|r| r.len() == 2)
        .and_then(|r| Some((r[0].as_i64()?, r[1].as_i64()?)))
        .ok_or_else(|| "Error: view_range must be [start, end]".to_string())?;
    match bounds {
        (start, _) if start < 1 => Err(format!("Error: invalid view_range start {start}")),
        (start, -1) => Ok(((start - 1) as usize, len)),
        (start, end) if end < start => Err(format!("Error: invalid view_range [{start}, {end}]")),
        (start, end) => Ok(((start - 1) as usize, (end as usize).min(len))),
    }
}

fn list_dir(path: &Path, arg: &str) -> Result<String, String> {
    let entries = std::fs::read_dir(path).map_err(|e| format!("Error: cannot read {arg}: {}", e.kind()))?;
    let mut names: Vec<String> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                return None;
            }
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            Some(if is_dir { format!("{name}/") } else { name })
        })
        .collect();
    names.sort();
    Ok(names.join("\n"))
}

fn read_text(path: &Path, arg: &str) -> Result<String, String> {
    if !path.is_file() {
        return Err(format!("Error: {arg} does not exist"));
    }
    std::fs::read_to_string(path).map_err(|_| format!("Error: {arg} is not a text file"))
}

fn write_text(path: &Path, arg: &str, contents: &str) -> Result<(), String> {
    std::fs::write(path, contents).map_err(|e| format!("Error: cannot write {arg}: {}", e.kind()))
}

fn str_replace(path: &Path, arg: &str, args: &Value) -> Result<ToolResultContent, String> {
    let old = required(args, "old_str")?;
    let new = args["new_str"].as_str().unwrap_or("");
    let contents = read_text(path, arg)?;
    match contents.matches(old).count() {
        0 => Err(format!("Error: old_str not found in {arg}")),
        1 => {
            write_text(path, arg, &contents.replacen(old, new, 1))?;
            Ok(text(format!("Replaced in {arg}")))
        }
        n => Err(format!("Error: old_str found {n} times, must be unique")),
    }
}

fn create(path: &Path, arg: &str, args: &Value) -> Result<ToolResultContent, String> {
    let contents = required(args, "file_text")?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Error: cannot create parent of {arg}: {}", e.kind()))?;
    }
    write_text(path, arg, contents)?;
    Ok(text(format!("Created {arg}")))
}

fn insert(path: &Path, arg: &str, args: &Value) -> Result<ToolResultContent, String> {
    let line = args["insert_line"]
        .as_u64()
        .ok_or_else(|| "Error: missing required parameter insert_line".to_string())? as usize;
    let new = required(args, "new_str")?;
    let contents = read_text(path, arg)?;

    let mut lines: Vec<String> = contents.split_inclusive('\n').map(str::to_string).collect();
    if line > lines.len() {
        return Err(format!(
            "Error: insert_line {line} out of range (file has {} lines)",
            lines.len()
        ));
    }
    let count = lines.len();
    if let Some(last) = lines.last_mut() {
        if line == count && !last.ends_with('\n') {
            last.push('\n');
        }
    }
    let mut inserted = new.to_string();
    if !inserted.ends_with('\n') {
        inserted.push('\n');
    }
    lines.insert(line, inserted);
    write_text(path, arg, &lines.concat())?;
    Ok(text(format!("Inserted at line {line} in {arg}")))
}
