//! 动作注册表
//!
//! 所有动作实现 Tool trait，注册后固化为不可变的 ActionDescriptor（名称、参数 schema、
//! 依赖、敏感级别、并发类别、处理器），由 ToolRegistry 按名查找并在所有执行循环间只读共享。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::core::{AgentError, ErrorKind};
use crate::llm::ToolSchema;
use crate::session::SessionManager;

/// 敏感级别：Destructive 表示不可逆的文件系统 / 网络变更，执行前必须经过审批闸门
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Sensitivity {
    Safe,
    Destructive,
}

/// 并发类别：两个调用仅当都为 Independent 时才可在同一轮中并发分发
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Concurrency {
    Independent,
    /// 依赖会话状态（如工作目录），只能单独执行
    Exclusive,
}

/// 动作失败的结构化记录；处理器的任何失败都以此形式返回，不会越过注册表边界
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{message}")]
pub struct ActionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ActionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ActionFailed, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// 写入 action-result 轮的 JSON 错误记录
    pub fn to_record(&self) -> String {
        json!({ "error": self.message, "kind": self.kind }).to_string()
    }
}

impl From<AgentError> for ActionError {
    fn from(e: AgentError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

/// 动作调用上下文：任务标识与会话管理器（有状态动作通过它获取执行环境）
#[derive(Clone)]
pub struct ActionContext {
    pub task_id: String,
    pub sessions: Arc<SessionManager>,
}

/// 动作 trait：名称、描述（供 LLM 理解）、参数 schema、依赖、异步执行（args 为已校验的 JSON 对象）
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 参数 JSON Schema（供 LLM 生成正确的参数格式）
    /// 默认返回空对象，表示无参数
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 运行所需的外部凭据（环境变量名）；缺失时动作从能力集中静默移除
    fn requirements(&self) -> Vec<String> {
        Vec::new()
    }

    fn sensitivity(&self) -> Sensitivity {
        Sensitivity::Safe
    }

    fn concurrency(&self) -> Concurrency {
        Concurrency::Independent
    }

    /// 需要经过危险模式匹配的命令参数名（如 terminal 的 "command"）
    fn command_argument(&self) -> Option<&str> {
        None
    }

    async fn execute(&self, args: Value, ctx: &ActionContext) -> Result<String, ActionError>;
}

/// 注册后固化的动作描述
pub struct ActionDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub requirements: Vec<String>,
    pub sensitivity: Sensitivity,
    pub concurrency: Concurrency,
    pub command_argument: Option<String>,
    pub handler: Arc<dyn Tool>,
}

impl ActionDescriptor {
    fn from_tool(tool: Arc<dyn Tool>) -> Self {
        Self {
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            parameters: tool.parameters_schema(),
            requirements: tool.requirements(),
            sensitivity: tool.sensitivity(),
            concurrency: tool.concurrency(),
            command_argument: tool.command_argument().map(String::from),
            handler: tool,
        }
    }

    pub fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }

    /// 从参数中取出待匹配的命令字符串
    pub fn command_of<'a>(&self, args: &'a Value) -> Option<&'a str> {
        self.command_argument
            .as_deref()
            .and_then(|key| args.get(key))
            .and_then(Value::as_str)
    }
}

impl std::fmt::Debug for ActionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionDescriptor")
            .field("name", &self.name)
            .field("requirements", &self.requirements)
            .field("sensitivity", &self.sensitivity)
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

/// 动作注册表：按名称有序存储，注册完成后只读
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<ActionDescriptor>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let descriptor = ActionDescriptor::from_tool(tool);
        if self.tools.contains_key(&descriptor.name) {
            tracing::warn!(tool = %descriptor.name, "tool re-registered, replacing previous handler");
        }
        self.tools.insert(descriptor.name.clone(), Arc::new(descriptor));
    }

    pub fn get(&self, name: &str) -> Option<Arc<ActionDescriptor>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &Arc<ActionDescriptor>> {
        self.tools.values()
    }

    /// 给定动作名集合的 schema（按名称排序）
    pub fn schemas_for<'a>(&self, names: impl IntoIterator<Item = &'a String>) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = names
            .into_iter()
            .filter_map(|n| self.tools.get(n))
            .map(|d| d.schema())
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy;

    #[async_trait]
    impl Tool for Dummy {
        fn name(&self) -> &str {
            "dummy"
        }
        fn description(&self) -> &str {
            "does nothing"
        }
        fn sensitivity(&self) -> Sensitivity {
            Sensitivity::Destructive
        }
        fn command_argument(&self) -> Option<&str> {
            Some("cmd")
        }
        async fn execute(&self, _args: Value, _ctx: &ActionContext) -> Result<String, ActionError> {
            Ok("ok".into())
        }
    }

    #[test]
    fn test_descriptor_is_frozen_from_tool() {
        let mut reg = ToolRegistry::new();
        reg.register(Dummy);
        let d = reg.get("dummy").unwrap();
        assert_eq!(d.sensitivity, Sensitivity::Destructive);
        assert_eq!(d.concurrency, Concurrency::Independent);
        assert_eq!(d.command_of(&json!({"cmd": "ls"})), Some("ls"));
        assert_eq!(d.command_of(&json!({"other": 1})), None);
        assert!(reg.get("missing").is_none());
    }

    #[test]
    fn test_error_record_shape() {
        let rec = ActionError::validation("bad").to_record();
        let v: Value = serde_json::from_str(&rec).unwrap();
        assert_eq!(v["error"], "bad");
        assert_eq!(v["kind"], "validation");
    }
}
