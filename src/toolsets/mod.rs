//! 工具集：可组合的动作分组、包含图校验与能力集解析

pub mod graph;
pub mod resolver;

pub use graph::{Toolset, ToolsetError, ToolsetGraph};
pub use resolver::{CapabilitySet, EnvProbe, RequirementProbe, ToolsetInfo, ToolsetResolver, WILDCARDS};

/// 内置工具集表
pub fn default_toolsets() -> Vec<Toolset> {
    vec![
        Toolset::new("web", "Web search and page extraction", &["web_search", "web_extract"], &[]),
        Toolset::new("terminal", "Shell command execution", &["terminal"], &[]),
        Toolset::new("research", "Research tasks: web only", &[], &["web"]),
        Toolset::new("default", "Everything built in", &[], &["web", "terminal"]),
    ]
}

/// 合并自定义工具集：同名定义覆盖内置定义
pub fn merge_toolsets(base: Vec<Toolset>, custom: Vec<Toolset>) -> Vec<Toolset> {
    let mut merged: Vec<Toolset> = base
        .into_iter()
        .filter(|b| !custom.iter().any(|c| c.name == b.name))
        .collect();
    merged.extend(custom);
    merged
}
