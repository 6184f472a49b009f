//! 能力集解析
//!
//! resolve 是纯函数：输入为工具集图、动作注册表（依赖表）、启用 / 禁用名单和注入的凭据探针，
//! 输出为本次运行可用的去重动作集合。禁用在展开之后扣除，因此总是优先于启用；
//! 依赖缺失的动作被静默移除，运行以降级能力继续。

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;

use crate::toolsets::{Toolset, ToolsetError, ToolsetGraph};
use crate::tools::ToolRegistry;

/// 表示「全部工具集」的通配名
pub const WILDCARDS: &[&str] = &["*", "all"];

/// 凭据 / 能力探针
pub trait RequirementProbe: Send + Sync {
    fn is_present(&self, requirement: &str) -> bool;
}

/// 通过环境变量判断凭据是否存在（非空即存在）
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvProbe;

impl RequirementProbe for EnvProbe {
    fn is_present(&self, requirement: &str) -> bool {
        std::env::var(requirement)
            .map(|v| !v.trim().is_empty())
            .unwrap_or(false)
    }
}

impl<F> RequirementProbe for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_present(&self, requirement: &str) -> bool {
        self(requirement)
    }
}

/// 一次运行的能力集
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CapabilitySet {
    actions: BTreeSet<String>,
}

impl CapabilitySet {
    pub fn from_actions<I, S>(actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            actions: actions.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, action: &str) -> bool {
        self.actions.contains(action)
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.actions.iter()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.actions.iter().cloned().collect()
    }
}

/// `hive toolsets` 列表中的一项
#[derive(Debug, Clone, Serialize)]
pub struct ToolsetInfo {
    pub name: String,
    pub description: String,
    pub actions: Vec<String>,
    /// 展开后不可用的动作及其缺失的依赖
    pub unavailable: Vec<(String, Vec<String>)>,
}

/// 工具集解析器：持有已校验的图和注册表
pub struct ToolsetResolver {
    graph: ToolsetGraph,
    registry: Arc<ToolRegistry>,
}

impl ToolsetResolver {
    /// 构建并校验工具集图；存在环时立即失败
    pub fn new(toolsets: Vec<Toolset>, registry: Arc<ToolRegistry>) -> Result<Self, ToolsetError> {
        Ok(Self {
            graph: ToolsetGraph::new(toolsets)?,
            registry,
        })
    }

    pub fn graph(&self) -> &ToolsetGraph {
        &self.graph
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn resolve(&self, enabled: &[String], disabled: &[String], probe: &dyn RequirementProbe) -> CapabilitySet {
        let wildcard = enabled.is_empty() || enabled.iter().any(|n| WILDCARDS.contains(&n.as_str()));

        let mut actions: BTreeSet<String> = BTreeSet::new();
        if wildcard {
            for name in self.graph.names() {
                if let Some(set) = self.graph.expand(name) {
                    actions.extend(set.iter().cloned());
                }
            }
        } else {
            for name in enabled {
                if let Some(set) = self.graph.expand(name) {
                    actions.extend(set.iter().cloned());
                } else if self.registry.contains(name) {
                    actions.insert(name.clone());
                } else {
                    tracing::warn!(toolset = %name, "unknown toolset, skipping");
                }
            }
        }

        for name in disabled {
            if let Some(set) = self.graph.expand(name) {
                actions.retain(|a| !set.contains(a));
            } else if !actions.remove(name) && !self.registry.contains(name) {
                tracing::debug!(toolset = %name, "unknown disabled name ignored");
            }
        }

        actions.retain(|action| match self.registry.get(action) {
            None => {
                tracing::debug!(tool = %action, "toolset references unregistered action, dropped");
                false
            }
            Some(d) => d.requirements.iter().all(|r| probe.is_present(r)),
        });

        CapabilitySet { actions }
    }

    /// 诊断：动作所属的工具集
    pub fn toolset_for_action(&self, action: &str) -> Option<&str> {
        self.graph.toolset_for_action(action)
    }

    /// 诊断：列出所有工具集及其可用性
    pub fn describe(&self, probe: &dyn RequirementProbe) -> Vec<ToolsetInfo> {
        self.graph
            .names()
            .filter_map(|name| {
                let ts = self.graph.get(name)?;
                let expanded = self.graph.expand(name)?;
                let unavailable = expanded
                    .iter()
                    .filter_map(|action| {
                        let missing: Vec<String> = match self.registry.get(action) {
                            None => vec!["(not registered)".to_string()],
                            Some(d) => d
                                .requirements
                                .iter()
                                .filter(|r| !probe.is_present(r))
                                .cloned()
                                .collect(),
                        };
                        (!missing.is_empty()).then(|| (action.clone(), missing))
                    })
                    .collect();
                Some(ToolsetInfo {
                    name: name.to_string(),
                    description: ts.description.clone(),
                    actions: expanded.iter().cloned().collect(),
                    unavailable,
                })
            })
            .collect()
    }
}
