use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use similar::TextDiff;
use tracing::debug;
use walkdir::WalkDir;

/// Files larger than this are left out of snapshots.
pub const MAX_SNAPSHOT_FILE_BYTES: u64 = 1024 * 1024;

/// Text contents of every regular file under a workspace, keyed by relative path.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkspaceSnapshot {
    files: BTreeMap<String, String>,
}

impl WorkspaceSnapshot {
    /// Walk `root`, skipping any directory named `state_dir`, symlinks,
    /// oversized files and files that are not UTF-8.
    pub fn capture(root: &Path, state_dir: &str) -> Self {
        let mut files = BTreeMap::new();
        let walker = WalkDir::new(root)
            .min_depth(1)
            .into_iter()
            .filter_entry(|entry| entry.file_name() != state_dir);
        for entry in walker.filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let too_big = entry
                .metadata()
                .map(|m| m.len() > MAX_SNAPSHOT_FILE_BYTES)
                .unwrap_or(true);
            if too_big {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(root) else {
                continue;
            };
            match std::fs::read(entry.path()).map(String::from_utf8) {
                Ok(Ok(text)) => {
                    files.insert(rel.to_string_lossy().replace('\\', "/"), text);
                }
                _ => debug!(path = %rel.display(), "skipping unreadable or binary file"),
            }
        }
        Self { files }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Unified diff from `self` to `after`, one section per changed file with
    /// `a/<path>` / `b/<path>` headers. Empty when nothing changed.
    pub fn diff(&self, after: &WorkspaceSnapshot) -> String {
        let paths: BTreeSet<&String> = self.files.keys().chain(after.files.keys()).collect();
        let mut parts = Vec::new();
        for path in paths {
            let old = self.files.get(path).map(String::as_str).unwrap_or("");
            let new = after.files.get(path).map(String::as_str).unwrap_or("");
            if old == new {
                continue;
            }
            let diff = TextDiff::from_lines(old, new)
                .unified_diff()
                .header(&format!("a/{path}"), &format!("b/{path}"))
                .to_string();
            parts.push(diff);
        }
        parts.join("\n")
    }
}
