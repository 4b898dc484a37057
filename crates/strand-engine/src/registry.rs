use std::sync::Arc;

use strand_core::tools::{Tool, ToolDefinition};

/// Where a registered tool runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToolSource {
    BuiltIn,
    /// Declared to the engine, executed by it.
    ServerSide,
    /// Supplied by the caller for this turn.
    Custom,
}

struct ToolEntry {
    tool: Arc<dyn Tool>,
    source: ToolSource,
}

/// Ordered set of tools offered to the engine. Definitions keep registration
/// order so the cache marker lands on a stable last tool.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<ToolEntry>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any earlier one with the same name in place.
    pub fn register(&mut self, tool: Arc<dyn Tool>, source: ToolSource) {
        let entry = ToolEntry { tool, source };
        match self.tools.iter_mut().find(|e| e.tool.name() == entry.tool.name()) {
            Some(existing) => *existing = entry,
            None => self.tools.push(entry),
        }
    }

    /// Get a tool that can be dispatched locally.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .iter()
            .find(|e| e.tool.name() == name && e.source != ToolSource::ServerSide)
            .map(|e| Arc::clone(&e.tool))
    }

    pub fn source(&self, name: &str) -> Option<&ToolSource> {
        self.tools.iter().find(|e| e.tool.name() == name).map(|e| &e.source)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.iter().any(|e| e.tool.name() == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|e| e.tool.name().to_string()).collect()
    }

    /// Tool definitions for the engine, in registration order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|e| e.tool.definition()).collect()
    }

    pub fn count(&self) -> usize {
        self.tools.len()
    }
}
