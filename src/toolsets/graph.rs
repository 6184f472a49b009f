//! 工具集包含图
//!
//! 使用邻接表和入度表实现 DAG 拓扑排序：构建时一次性校验（未知引用、重复定义、环），
//! 并按拓扑序自底向上展开每个工具集，之后的查询都读取记忆化结果。

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 工具集：动作列表 + 包含的其他工具集
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Toolset {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub includes: Vec<String>,
}

impl Toolset {
    pub fn new(name: &str, description: &str, actions: &[&str], includes: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            actions: actions.iter().map(|s| s.to_string()).collect(),
            includes: includes.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ToolsetError {
    #[error("toolset include cycle detected among: {}", .0.join(", "))]
    Cycle(Vec<String>),
    #[error("toolset '{from}' includes unknown toolset '{missing}'")]
    UnknownInclude { from: String, missing: String },
    #[error("duplicate toolset definition '{0}'")]
    Duplicate(String),
}

/// 工具集依赖图（已校验无环）
#[derive(Debug, Clone)]
pub struct ToolsetGraph {
    toolsets: BTreeMap<String, Toolset>,
    /// 工具集名 -> 递归展开后的动作集合
    expanded: BTreeMap<String, BTreeSet<String>>,
}

impl ToolsetGraph {
    pub fn new(toolsets: Vec<Toolset>) -> Result<Self, ToolsetError> {
        let mut by_name: BTreeMap<String, Toolset> = BTreeMap::new();
        for ts in toolsets {
            if by_name.contains_key(&ts.name) {
                return Err(ToolsetError::Duplicate(ts.name));
            }
            by_name.insert(ts.name.clone(), ts);
        }

        // 邻接表：被包含者 -> 包含它的工具集；入度：尚未展开的被包含者数量
        let mut adjacency: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
        for name in by_name.keys() {
            in_degree.insert(name.as_str(), 0);
        }
        for ts in by_name.values() {
            let includes: BTreeSet<&str> = ts.includes.iter().map(String::as_str).collect();
            for inc in includes {
                if !by_name.contains_key(inc) {
                    return Err(ToolsetError::UnknownInclude {
                        from: ts.name.clone(),
                        missing: inc.to_string(),
                    });
                }
                adjacency.entry(inc).or_default().push(ts.name.as_str());
                *in_degree.entry(ts.name.as_str()).or_insert(0) += 1;
            }
        }

        let mut ready: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut expanded: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        while let Some(name) = ready.pop_front() {
            let ts = &by_name[name];
            let mut actions: BTreeSet<String> = ts.actions.iter().cloned().collect();
            for inc in &ts.includes {
                if let Some(sub) = expanded.get(inc) {
                    actions.extend(sub.iter().cloned());
                }
            }
            expanded.insert(name.to_string(), actions);

            for dependent in adjacency.get(name).cloned().unwrap_or_default() {
                if let Some(d) = in_degree.get_mut(&dependent) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push_back(dependent);
                    }
                }
            }
        }

        if expanded.len() < by_name.len() {
            let stuck: Vec<String> = by_name
                .keys()
                .filter(|n| !expanded.contains_key(*n))
                .cloned()
                .collect();
            return Err(ToolsetError::Cycle(stuck));
        }

        Ok(Self {
            toolsets: by_name,
            expanded,
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.toolsets.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Toolset> {
        self.toolsets.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.toolsets.keys().map(String::as_str)
    }

    /// 递归展开后的动作集合
    pub fn expand(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.expanded.get(name)
    }

    /// 动作所属的工具集：优先直接列出该动作的工具集，其次是包含它的工具集（按名称序）
    pub fn toolset_for_action(&self, action: &str) -> Option<&str> {
        self.toolsets
            .values()
            .find(|ts| ts.actions.iter().any(|a| a == action))
            .or_else(|| {
                self.toolsets
                    .values()
                    .find(|ts| self.expanded.get(&ts.name).is_some_and(|e| e.contains(action)))
            })
            .map(|ts| ts.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expansion_is_transitive() {
        let graph = ToolsetGraph::new(vec![
            Toolset::new("a", "", &["x"], &[]),
            Toolset::new("b", "", &["y"], &["a"]),
            Toolset::new("c", "", &[], &["b", "a"]),
        ])
        .unwrap();
        let c: Vec<&str> = graph.expand("c").unwrap().iter().map(String::as_str).collect();
        assert_eq!(c, vec!["x", "y"]);
    }

    #[test]
    fn test_cycle_fails_with_sorted_members() {
        let err = ToolsetGraph::new(vec![
            Toolset::new("ok", "", &["x"], &[]),
            Toolset::new("b", "", &[], &["a"]),
            Toolset::new("a", "", &[], &["b"]),
        ])
        .unwrap_err();
        assert_eq!(err, ToolsetError::Cycle(vec!["a".into(), "b".into()]));
    }

    #[test]
    fn test_self_include_is_a_cycle() {
        let err = ToolsetGraph::new(vec![Toolset::new("me", "", &[], &["me"])]).unwrap_err();
        assert!(matches!(err, ToolsetError::Cycle(_)));
    }

    #[test]
    fn test_unknown_include_and_duplicate() {
        assert!(matches!(
            ToolsetGraph::new(vec![Toolset::new("a", "", &[], &["ghost"])]),
            Err(ToolsetError::UnknownInclude { .. })
        ));
        assert_eq!(
            ToolsetGraph::new(vec![Toolset::new("a", "", &[], &[]), Toolset::new("a", "", &[], &[])])
                .unwrap_err(),
            ToolsetError::Duplicate("a".into())
        );
    }

    #[test]
    fn test_toolset_for_action_prefers_direct_listing() {
        let graph = ToolsetGraph::new(vec![
            Toolset::new("all", "", &[], &["web"]),
            Toolset::new("web", "", &["web_search"], &[]),
        ])
        .unwrap();
        assert_eq!(graph.toolset_for_action("web_search"), Some("web"));
        assert_eq!(graph.toolset_for_action("nope"), None);
    }
}
