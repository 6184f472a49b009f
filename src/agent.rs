//! 组装层：从 AppConfig 构建模型客户端、动作注册表、工具集解析、审批闸门与执行循环
//!
//! `hive run` 直接调用 [`Harness::run`]；批量模式通过 [`TaskRunner`] 使用同一个 Harness（审批始终非交互）。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::batch::{TaskRequest, TaskRunner};
use crate::config::AppConfig;
use crate::core::{AgentError, RecoveryEngine};
use crate::llm::{LlmClient, OpenAiClient};
use crate::react::{AgentLoop, LoopSettings, ReactEvent, RunOutcome, RunTask, DEFAULT_SYSTEM_PROMPT};
use crate::safety::{ApprovalAllowlist, ApprovalGate, ApprovalPrompt, NonInteractive};
use crate::session::SessionManager;
use crate::toolsets::{
    default_toolsets, merge_toolsets, CapabilitySet, EnvProbe, RequirementProbe, ToolsetInfo, ToolsetResolver,
};
use crate::tools::{builtin_registry, ToolExecutor, ToolRegistry};

pub struct Harness {
    agent: AgentLoop,
    resolver: ToolsetResolver,
    probe: Arc<dyn RequirementProbe>,
    model: String,
    max_turns: usize,
    enabled: Vec<String>,
    disabled: Vec<String>,
}

/// 按 [llm] 段创建 OpenAI 兼容客户端
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let api_key = cfg.llm.api_key();
    if api_key.is_none() {
        tracing::warn!(env = %cfg.llm.api_key_env, "no API key set, requests are sent unauthenticated");
    }
    Arc::new(OpenAiClient::new(
        &cfg.llm.base_url,
        &cfg.llm.model,
        api_key,
        Duration::from_secs(cfg.llm.timeouts.request),
    ))
}

fn loop_settings(cfg: &AppConfig) -> LoopSettings {
    let agent = &cfg.agent;
    LoopSettings {
        system_prompt: agent
            .system_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
        max_concurrent_actions: agent.max_concurrent_actions,
        run_timeout: agent.run_timeout_secs.map(Duration::from_secs),
        grace_period: Duration::from_secs(agent.grace_period_secs),
        model_timeout: Duration::from_secs(cfg.llm.timeouts.request),
        compression: agent.compression.clone(),
    }
}

impl Harness {
    /// 完整构建：OpenAI 兼容客户端 + 内置动作 + 持久化白名单
    pub fn from_config(cfg: &AppConfig, prompt: Arc<dyn ApprovalPrompt>) -> Result<Self, AgentError> {
        let allowlist = ApprovalAllowlist::load(cfg.approval.resolved_allowlist_path())
            .map_err(|e| AgentError::ConfigError(e.to_string()))?;
        let llm = create_llm_from_config(cfg);
        let registry = builtin_registry(cfg.agent.tool_timeout_secs);
        Self::build(cfg, llm, registry, Arc::new(allowlist), prompt)
    }

    /// 指定模型客户端与注册表（测试使用 MockLlmClient）
    pub fn build(
        cfg: &AppConfig,
        llm: Arc<dyn LlmClient>,
        registry: ToolRegistry,
        allowlist: Arc<ApprovalAllowlist>,
        prompt: Arc<dyn ApprovalPrompt>,
    ) -> Result<Self, AgentError> {
        let registry = Arc::new(registry);
        let toolsets = merge_toolsets(default_toolsets(), cfg.toolsets.custom.clone());
        let resolver = ToolsetResolver::new(toolsets, registry.clone())?;
        let gate = Arc::new(ApprovalGate::new(allowlist, prompt));
        let sessions = Arc::new(SessionManager::new(cfg.terminal.clone()));
        let agent = AgentLoop::new(llm, registry, gate, sessions, loop_settings(cfg))
            .with_executor(ToolExecutor::new(cfg.agent.tool_timeout_secs))
            .with_recovery(RecoveryEngine::new(cfg.llm.retry.clone()))
            .with_context_length(cfg.llm.context_length);
        tracing::info!(
            model = %cfg.llm.model,
            backend = cfg.terminal.backend.as_str(),
            toolsets = resolver.graph().names().count(),
            "harness ready"
        );
        Ok(Self {
            agent,
            resolver,
            probe: Arc::new(EnvProbe),
            model: cfg.llm.model.clone(),
            max_turns: cfg.agent.max_turns,
            enabled: cfg.toolsets.enabled.clone(),
            disabled: cfg.toolsets.disabled.clone(),
        })
    }

    /// 批量模式：审批通道替换为非交互
    pub fn non_interactive(cfg: &AppConfig) -> Result<Self, AgentError> {
        Self::from_config(cfg, Arc::new(NonInteractive))
    }

    pub fn with_probe(mut self, probe: Arc<dyn RequirementProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_event_tx(mut self, tx: UnboundedSender<ReactEvent>) -> Self {
        self.agent = self.agent.with_event_tx(tx);
        self
    }

    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.agent = self.agent.with_shutdown(token);
        self
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn resolver(&self) -> &ToolsetResolver {
        &self.resolver
    }

    /// 空列表回落到配置中的默认值
    pub fn capabilities(&self, enabled: &[String], disabled: &[String]) -> CapabilitySet {
        let enabled = if enabled.is_empty() { &self.enabled } else { enabled };
        let disabled = if disabled.is_empty() { &self.disabled } else { disabled };
        self.resolver.resolve(enabled, disabled, self.probe.as_ref())
    }

    pub fn describe_toolsets(&self) -> Vec<ToolsetInfo> {
        self.resolver.describe(self.probe.as_ref())
    }

    pub async fn run(&self, task: &RunTask, enabled: &[String], disabled: &[String], max_turns: usize) -> RunOutcome {
        let caps = self.capabilities(enabled, disabled);
        tracing::debug!(task_id = %task.task_id, capabilities = ?caps.names(), "capabilities resolved");
        self.agent.run(task, &caps, max_turns).await
    }
}

#[async_trait]
impl TaskRunner for Harness {
    async fn run_task(&self, request: TaskRequest) -> RunOutcome {
        self.run(&request.task, &request.enabled, &request.disabled, request.max_turns)
            .await
    }

    fn model_name(&self) -> String {
        self.model.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{MockLlmClient, ModelResponse};
    use crate::react::RunStatus;

    fn harness(llm: MockLlmClient) -> Harness {
        let cfg = AppConfig::default();
        Harness::build(
            &cfg,
            Arc::new(llm),
            builtin_registry(5),
            Arc::new(ApprovalAllowlist::in_memory()),
            Arc::new(NonInteractive),
        )
        .unwrap()
        .with_probe(Arc::new(|_: &str| false))
    }

    #[test]
    fn test_missing_credentials_drop_web_search() {
        let h = harness(MockLlmClient::echo());
        let caps = h.capabilities(&["web".to_string()], &[]);
        assert_eq!(caps.names(), vec!["web_extract".to_string()]);
        assert_eq!(h.resolver().toolset_for_action("terminal"), Some("terminal"));
    }

    #[tokio::test]
    async fn test_runs_through_task_runner_seam() {
        let h = harness(MockLlmClient::scripted(vec![Ok(ModelResponse::text("42"))]));
        let outcome = h
            .run_task(TaskRequest {
                task: RunTask::new("t", "answer"),
                enabled: vec!["research".into()],
                disabled: vec![],
                max_turns: 3,
            })
            .await;
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.final_response, "42");
        assert_eq!(h.model_name(), "gpt-4o-mini");
    }
}
