pub mod bash;
pub mod editor;
pub mod render;
pub mod web_search;

use std::sync::Arc;

use strand_core::tools::CustomToolSpec;

use crate::registry::{ToolRegistry, ToolSource};
use crate::sandbox::Sandbox;

/// Built-in tools followed by the caller's custom tools.
pub fn create_default_registry(sandbox: &Sandbox, custom: &[CustomToolSpec]) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    registry.register(Arc::new(bash::BashTool::new(sandbox.clone())), ToolSource::BuiltIn);
    registry.register(
        Arc::new(editor::EditorTool::new(sandbox.mount_point())),
        ToolSource::BuiltIn,
    );
    registry.register(Arc::new(web_search::WebSearchTool), ToolSource::ServerSide);

    for spec in custom {
        registry.register(Arc::new(render::RenderTool::new(spec.clone())), ToolSource::Custom);
    }

    registry
}
