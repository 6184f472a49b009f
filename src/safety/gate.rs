//! 审批闸门：危险动作执行前的拦截点
//!
//! 判定顺序：
//! 1. 敏感 = 动作描述为 Destructive，或命令参数命中危险模式；否则直接放行
//! 2. 隔离后端（Docker）自动放行
//! 3. 本次运行已「会话内允许」或持久白名单中已有该模式则放行
//! 4. 否则通过 ApprovalPrompt 询问（once / session / always / deny）；
//!    没有交互通道时一律拒绝并附说明，绝不静默放行

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::safety::{ApprovalAllowlist, PatternRules};
use crate::session::Backend;
use crate::tools::{ActionDescriptor, Sensitivity};

/// 审批范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalScope {
    Once,
    /// 本次运行剩余时间内允许
    Session,
    /// 永久允许（写入白名单）
    Always,
    Deny,
}

/// 闸门结论
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny { reason: String },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// 发给审批通道的请求
#[derive(Debug, Clone)]
pub struct ApprovalRequest<'a> {
    pub task_id: &'a str,
    pub action: &'a str,
    pub command: Option<&'a str>,
    /// 白名单键（危险模式 key 或 `action:<name>`）
    pub pattern_key: &'a str,
    pub description: &'a str,
}

/// 审批通道：返回 None 表示无法询问（非交互环境）
#[async_trait]
pub trait ApprovalPrompt: Send + Sync {
    async fn ask(&self, request: &ApprovalRequest<'_>) -> Option<ApprovalScope>;
}

/// 非交互环境（批量运行、消息平台）：永远无法询问
#[derive(Debug, Default, Clone, Copy)]
pub struct NonInteractive;

#[async_trait]
impl ApprovalPrompt for NonInteractive {
    async fn ask(&self, _request: &ApprovalRequest<'_>) -> Option<ApprovalScope> {
        None
    }
}

/// 单次运行的审批上下文：任务、后端、会话内允许集合
#[derive(Debug)]
pub struct RunContext {
    pub task_id: String,
    pub backend: Backend,
    session_approvals: Mutex<HashSet<String>>,
}

impl RunContext {
    pub fn new(task_id: impl Into<String>, backend: Backend) -> Self {
        Self {
            task_id: task_id.into(),
            backend,
            session_approvals: Mutex::new(HashSet::new()),
        }
    }

    fn session_allows(&self, key: &str) -> bool {
        self.session_approvals
            .lock()
            .map(|s| s.contains(key))
            .unwrap_or(false)
    }

    fn allow_for_session(&self, key: &str) {
        if let Ok(mut s) = self.session_approvals.lock() {
            s.insert(key.to_string());
        }
    }
}

pub struct ApprovalGate {
    rules: PatternRules,
    allowlist: Arc<ApprovalAllowlist>,
    prompt: Arc<dyn ApprovalPrompt>,
}

impl ApprovalGate {
    pub fn new(allowlist: Arc<ApprovalAllowlist>, prompt: Arc<dyn ApprovalPrompt>) -> Self {
        Self {
            rules: PatternRules::new(),
            allowlist,
            prompt,
        }
    }

    /// 非交互闸门（批量模式）
    pub fn non_interactive(allowlist: Arc<ApprovalAllowlist>) -> Self {
        Self::new(allowlist, Arc::new(NonInteractive))
    }

    pub fn allowlist(&self) -> &Arc<ApprovalAllowlist> {
        &self.allowlist
    }

    /// 命令命中的每一条危险模式都必须单独获准，已获准的模式不会连带放行同一命令中的其他模式
    pub async fn authorize(&self, action: &ActionDescriptor, args: &Value, ctx: &RunContext) -> Decision {
        let command = action.command_of(args);
        let mut sensitive: Vec<(String, String)> = command
            .map(|c| self.rules.detect_all(c))
            .unwrap_or_default()
            .into_iter()
            .map(|p| (p.key.to_string(), p.description.to_string()))
            .collect();
        if sensitive.is_empty() && action.sensitivity == Sensitivity::Destructive {
            sensitive.push((
                format!("action:{}", action.name),
                format!("destructive action '{}'", action.name),
            ));
        }
        if sensitive.is_empty() {
            return Decision::Allow;
        }

        if ctx.backend.is_isolated() {
            tracing::debug!(task_id = %ctx.task_id, tool = %action.name, patterns = sensitive.len(), "sensitive action auto-allowed on isolated backend");
            return Decision::Allow;
        }

        for (key, description) in &sensitive {
            if ctx.session_allows(key) || self.allowlist.contains(key) {
                tracing::debug!(task_id = %ctx.task_id, pattern = %key, "sensitive pattern pre-approved");
                continue;
            }
            let request = ApprovalRequest {
                task_id: &ctx.task_id,
                action: &action.name,
                command,
                pattern_key: key,
                description,
            };
            if let Decision::Deny { reason } = self.ask(&request, ctx).await {
                return Decision::Deny { reason };
            }
        }
        Decision::Allow
    }

    async fn ask(&self, request: &ApprovalRequest<'_>, ctx: &RunContext) -> Decision {
        let key = request.pattern_key;
        let description = request.description;
        match self.prompt.ask(request).await {
            Some(ApprovalScope::Once) => Decision::Allow,
            Some(ApprovalScope::Session) => {
                ctx.allow_for_session(key);
                Decision::Allow
            }
            Some(ApprovalScope::Always) => {
                if let Err(e) = self.allowlist.add(key).await {
                    tracing::warn!(pattern = %key, error = %e, "failed to persist approval, allowing once");
                }
                Decision::Allow
            }
            Some(ApprovalScope::Deny) => {
                tracing::info!(task_id = %ctx.task_id, tool = %request.action, pattern = %key, "sensitive action denied by user");
                Decision::Deny {
                    reason: format!("{description} was denied by the user; the command was not executed"),
                }
            }
            None => {
                tracing::info!(task_id = %ctx.task_id, tool = %request.action, pattern = %key, "sensitive action denied: no approval channel");
                Decision::Deny {
                    reason: format!(
                        "{description} requires approval, but no interactive approval channel is available; the command was not executed. Try a safer alternative."
                    ),
                }
            }
        }
    }
}
