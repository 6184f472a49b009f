pub mod executor;
pub mod registry;
pub mod schema;
pub mod terminal;
pub mod web;

pub use executor::{validate_arguments, ToolExecutor};
pub use registry::{
    ActionContext, ActionDescriptor, ActionError, Concurrency, Sensitivity, Tool, ToolRegistry,
};
pub use terminal::TerminalTool;
pub use web::{WebExtractTool, WebSearchTool};

/// 注册内置动作：terminal、web_search、web_extract
pub fn builtin_registry(tool_timeout_secs: u64) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(TerminalTool::new(tool_timeout_secs));
    registry.register(WebSearchTool::new(30));
    registry.register(WebExtractTool::new(30, 20_000));
    registry
}
