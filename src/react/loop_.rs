//! 执行循环
//!
//! AwaitingModel -> (ActionRequested | FinalAnswer | TurnLimitReached | FatalError)
//! 每轮：检查轮数与截止时间 -> 必要时压缩上下文 -> 调用模型（带重试） ->
//! 纯文本即最终回答；否则逐个校验、过审批闸门、分发动作，结果按请求顺序写回对话。
//! 动作失败、校验拒绝、安全拒绝都只作为 action-result 轮返回给模型，不终止循环。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, ErrorKind, RecoveryAction, RecoveryEngine, RunSupervisor, TaskScheduler};
use crate::llm::{LlmClient, LlmError, ModelRequest, ModelResponse, ToolSchema};
use crate::memory::{to_trajectory, ContextMonitor, Conversation, Message, ToolCallRequest, TrajectoryTurn};
use crate::react::{CompressionSettings, ContextCompressor, ElidingCompressor, ReactEvent};
use crate::safety::{ApprovalGate, Decision, RunContext};
use crate::session::SessionManager;
use crate::toolsets::CapabilitySet;
use crate::tools::{ActionContext, ActionDescriptor, ActionError, Concurrency, ToolExecutor, ToolRegistry};

/// 没有任何 assistant 文本时的最终回答占位
pub const NO_ANSWER: &str = "(no answer)";

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a capable assistant that completes tasks by calling the provided tools when they help. When the task is done, reply with the final answer as plain text.";

/// Observation 预览最大字符数
const OBSERVATION_PREVIEW_CHARS: usize = 200;
/// 思考内容展示最大字符数
const THINKING_PREVIEW_CHARS: usize = 800;

/// 一次运行的输入
#[derive(Debug, Clone)]
pub struct RunTask {
    pub task_id: String,
    pub prompt: String,
    /// 执行时生效、导出轨迹时省略的临时指令
    pub ephemeral: Option<String>,
}

impl RunTask {
    pub fn new(task_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            prompt: prompt.into(),
            ephemeral: None,
        }
    }

    pub fn with_ephemeral(mut self, ephemeral: Option<String>) -> Self {
        self.ephemeral = ephemeral;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    /// 达到轮数上限或截止时间：非致命的已报告结果
    TurnLimitReached,
    Failed(ErrorKind),
}

/// 单次动作调用记录（用于批量统计）
#[derive(Debug, Clone, Serialize)]
pub struct ActionRecord {
    pub call_id: String,
    pub tool: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub duration_ms: u64,
}

/// 运行结果
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub task_id: String,
    pub status: RunStatus,
    /// 最终回答；没有时为 NO_ANSWER
    pub final_response: String,
    /// 导出用消息（不含临时指令）
    pub messages: Vec<Message>,
    pub turns: usize,
    pub api_calls: u32,
    pub actions: Vec<ActionRecord>,
    pub error: Option<String>,
}

impl RunOutcome {
    pub fn completed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// 完成或到达轮数上限都算成功；Failed（包括 Cancelled）算失败
    pub fn succeeded(&self) -> bool {
        !matches!(self.status, RunStatus::Failed(_))
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self.status {
            RunStatus::Failed(kind) => Some(kind),
            _ => None,
        }
    }

    pub fn trajectory(&self) -> Vec<TrajectoryTurn> {
        to_trajectory(&self.messages)
    }

    /// 循环之外的失败（如任务 panic）：没有对话可导出
    pub fn aborted(task_id: impl Into<String>, kind: ErrorKind, error: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: RunStatus::Failed(kind),
            final_response: NO_ANSWER.to_string(),
            messages: Vec::new(),
            turns: 0,
            api_calls: 0,
            actions: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// 执行循环参数
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub system_prompt: String,
    pub max_concurrent_actions: usize,
    /// 墙钟截止时间
    pub run_timeout: Option<Duration>,
    /// 截止后允许进行中的动作继续执行的时长
    pub grace_period: Duration,
    /// 单次模型调用超时（计入重试预算）
    pub model_timeout: Duration,
    pub compression: CompressionSettings,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_concurrent_actions: 3,
            run_timeout: None,
            grace_period: Duration::from_secs(10),
            model_timeout: Duration::from_secs(120),
            compression: CompressionSettings::default(),
        }
    }
}

enum Exit {
    Final,
    TurnLimit,
    Fatal(AgentError),
}

/// 动作在分发前的状态
enum Prepared {
    /// 本地已得出结果（不可用、参数错误、审批拒绝），不会分发
    Resolved(ActionError),
    Ready(Arc<ActionDescriptor>, Value),
}

/// 保证任务会话在任何退出路径上都被释放
struct SessionGuard {
    sessions: Arc<SessionManager>,
    task_id: String,
    armed: bool,
}

impl SessionGuard {
    async fn release(mut self) {
        self.armed = false;
        self.sessions.release(&self.task_id).await;
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let sessions = self.sessions.clone();
            let task_id = std::mem::take(&mut self.task_id);
            handle.spawn(async move { sessions.release(&task_id).await });
        }
    }
}

/// 执行循环：在所有任务间共享，每次 run 独立持有对话、监管器与调度器
pub struct AgentLoop {
    llm: Arc<dyn LlmClient>,
    registry: Arc<ToolRegistry>,
    executor: ToolExecutor,
    gate: Arc<ApprovalGate>,
    sessions: Arc<SessionManager>,
    recovery: RecoveryEngine,
    compressor: Arc<dyn ContextCompressor>,
    monitor: ContextMonitor,
    settings: LoopSettings,
    event_tx: Option<UnboundedSender<ReactEvent>>,
    shutdown: Option<CancellationToken>,
}

fn send_event(tx: &Option<UnboundedSender<ReactEvent>>, ev: ReactEvent) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}

/// 空的或重复的 call id 改名为唯一值，返回改名数量
fn ensure_unique_call_ids(calls: &mut [ToolCallRequest]) -> usize {
    let mut seen: HashSet<String> = HashSet::with_capacity(calls.len());
    let mut renamed = 0;
    for call in calls.iter_mut() {
        if !call.id.trim().is_empty() && !seen.contains(&call.id) {
            seen.insert(call.id.clone());
            continue;
        }
        let base = if call.id.trim().is_empty() { "call" } else { call.id.as_str() };
        let mut n = 1;
        let mut candidate = format!("{base}_{n}");
        while seen.contains(&candidate) {
            n += 1;
            candidate = format!("{base}_{n}");
        }
        tracing::warn!(original = %call.id, renamed = %candidate, tool = %call.name, "tool call id is empty or duplicated, renamed");
        seen.insert(candidate.clone());
        call.id = candidate;
        renamed += 1;
    }
    renamed
}

fn preview(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        format!("{}...", s.chars().take(max).collect::<String>())
    } else {
        s.to_string()
    }
}

impl AgentLoop {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        registry: Arc<ToolRegistry>,
        gate: Arc<ApprovalGate>,
        sessions: Arc<SessionManager>,
        settings: LoopSettings,
    ) -> Self {
        let monitor = ContextMonitor::new(128_000, settings.compression.threshold);
        Self {
            llm,
            registry,
            executor: ToolExecutor::new(180),
            gate,
            sessions,
            recovery: RecoveryEngine::default(),
            compressor: Arc::new(ElidingCompressor::default()),
            monitor,
            settings,
            event_tx: None,
            shutdown: None,
        }
    }

    pub fn with_executor(mut self, executor: ToolExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_recovery(mut self, recovery: RecoveryEngine) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn with_compressor(mut self, compressor: Arc<dyn ContextCompressor>) -> Self {
        self.compressor = compressor;
        self
    }

    /// 模型上下文长度（token），与压缩阈值一起决定何时压缩
    pub fn with_context_length(mut self, context_length: usize) -> Self {
        self.monitor = ContextMonitor::new(context_length, self.settings.compression.threshold);
        self
    }

    pub fn with_event_tx(mut self, tx: UnboundedSender<ReactEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// 进程级关闭令牌（Ctrl+C）；每次运行使用其子令牌
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    fn system_prompt(&self, caps: &CapabilitySet) -> String {
        if caps.is_empty() {
            format!("{}\n\nNo tools are available in this run.", self.settings.system_prompt)
        } else {
            format!(
                "{}\n\nAvailable tools: {}.",
                self.settings.system_prompt,
                caps.names().join(", ")
            )
        }
    }

    /// 驱动一个任务直到终止状态；本方法不返回错误，所有失败都体现在 RunOutcome 中
    pub async fn run(&self, task: &RunTask, caps: &CapabilitySet, max_turns: usize) -> RunOutcome {
        let supervisor = match &self.shutdown {
            Some(parent) => RunSupervisor::with_parent(parent, self.settings.run_timeout, self.settings.grace_period),
            None => RunSupervisor::new(self.settings.run_timeout, self.settings.grace_period),
        };
        let scheduler = TaskScheduler::new(self.settings.max_concurrent_actions);
        let run_ctx = RunContext::new(&task.task_id, self.sessions.backend());
        let action_ctx = ActionContext {
            task_id: task.task_id.clone(),
            sessions: self.sessions.clone(),
        };
        let guard = SessionGuard {
            sessions: self.sessions.clone(),
            task_id: task.task_id.clone(),
            armed: true,
        };

        let mut conv = Conversation::new(self.system_prompt(caps), task.ephemeral.clone(), &task.prompt);
        let schemas = self.registry.schemas_for(caps.iter());
        let mut api_calls: u32 = 0;
        let mut actions: Vec<ActionRecord> = Vec::new();
        let mut turn: usize = 0;
        let mut final_text: Option<String> = None;

        tracing::info!(task_id = %task.task_id, tools = caps.len(), max_turns, "run started");

        let exit = loop {
            if turn >= max_turns {
                tracing::info!(task_id = %task.task_id, turn, "turn limit reached");
                break Exit::TurnLimit;
            }
            if supervisor.is_cancelled() {
                break Exit::Fatal(AgentError::Cancelled);
            }
            if supervisor.is_expired() {
                tracing::warn!(task_id = %task.task_id, turn, "run deadline reached before model call");
                break Exit::TurnLimit;
            }
            send_event(&self.event_tx, ReactEvent::StepUpdate { step: turn + 1, max_steps: max_turns });

            self.maybe_compress(&mut conv).await;

            send_event(&self.event_tx, ReactEvent::Thinking);
            let response = match self.call_model(&mut conv, &schemas, &mut api_calls, &supervisor).await {
                Ok(r) => r,
                Err(AgentError::DeadlineExceeded) => {
                    tracing::warn!(task_id = %task.task_id, turn, "run deadline reached while waiting for model");
                    break Exit::TurnLimit;
                }
                Err(e) => break Exit::Fatal(e),
            };
            turn += 1;

            let ModelResponse {
                content,
                mut tool_calls,
                reasoning,
            } = response;
            if let Some(r) = &reasoning {
                send_event(&self.event_tx, ReactEvent::ThinkingContent {
                    text: preview(r, THINKING_PREVIEW_CHARS),
                });
            }
            let content = content.unwrap_or_default();

            if tool_calls.is_empty() {
                final_text = Some(content.trim().to_string()).filter(|t| !t.is_empty());
                if let Err(e) = conv.push_assistant(Message::assistant_with_calls(content, Vec::new(), reasoning)) {
                    break Exit::Fatal(AgentError::Session(e.to_string()));
                }
                break Exit::Final;
            }

            ensure_unique_call_ids(&mut tool_calls);
            let calls = tool_calls.clone();
            if let Err(e) = conv.push_assistant(Message::assistant_with_calls(content, tool_calls, reasoning)) {
                break Exit::Fatal(AgentError::Session(e.to_string()));
            }

            let (results, interrupted) = self
                .dispatch(&calls, caps, &run_ctx, &action_ctx, &scheduler, &supervisor)
                .await;

            let mut folded = Ok(());
            for (call, (result, elapsed)) in calls.iter().zip(results) {
                actions.push(ActionRecord {
                    call_id: call.id.clone(),
                    tool: call.name.clone(),
                    ok: result.is_ok(),
                    error_kind: result.as_ref().err().map(|e| e.kind),
                    duration_ms: elapsed.as_millis() as u64,
                });
                let content = match result {
                    Ok(payload) => {
                        send_event(&self.event_tx, ReactEvent::Observation {
                            tool: call.name.clone(),
                            preview: preview(&payload, OBSERVATION_PREVIEW_CHARS),
                        });
                        payload
                    }
                    Err(e) => {
                        let ev = if e.kind == ErrorKind::SafetyDenied {
                            ReactEvent::ApprovalDenied {
                                tool: call.name.clone(),
                                reason: e.message.clone(),
                            }
                        } else {
                            ReactEvent::ToolFailure {
                                tool: call.name.clone(),
                                reason: e.message.clone(),
                            }
                        };
                        send_event(&self.event_tx, ev);
                        e.to_record()
                    }
                };
                if let Err(e) = conv.push_tool_result(&call.id, content) {
                    folded = Err(e);
                    break;
                }
            }
            if let Err(e) = folded {
                break Exit::Fatal(AgentError::Session(e.to_string()));
            }
            if interrupted {
                if supervisor.is_cancelled() {
                    break Exit::Fatal(AgentError::Cancelled);
                }
                tracing::warn!(task_id = %task.task_id, turn, "run deadline reached during dispatch");
                break Exit::TurnLimit;
            }
        };

        guard.release().await;

        let (prompt_tokens, completion_tokens, total_tokens) = self.llm.token_usage();
        send_event(&self.event_tx, ReactEvent::TokenUsage {
            prompt_tokens,
            completion_tokens,
            total_tokens,
        });

        let fallback = || {
            conv.last_assistant_text()
                .map(str::to_string)
                .unwrap_or_else(|| NO_ANSWER.to_string())
        };
        let (status, final_response, error) = match exit {
            Exit::Final => (RunStatus::Completed, final_text.unwrap_or_else(fallback), None),
            Exit::TurnLimit => (RunStatus::TurnLimitReached, fallback(), None),
            Exit::Fatal(AgentError::Cancelled) => {
                tracing::warn!(task_id = %task.task_id, turn, "run cancelled");
                let e = AgentError::Cancelled;
                (RunStatus::Failed(e.kind()), fallback(), Some(e.to_string()))
            }
            Exit::Fatal(e) => {
                tracing::error!(task_id = %task.task_id, error = %e, "run failed");
                send_event(&self.event_tx, ReactEvent::Error { text: e.to_string() });
                (RunStatus::Failed(e.kind()), fallback(), Some(e.to_string()))
            }
        };
        send_event(&self.event_tx, ReactEvent::Final {
            text: final_response.clone(),
            completed: status == RunStatus::Completed,
        });
        tracing::info!(task_id = %task.task_id, ?status, turns = turn, api_calls, "run finished");

        RunOutcome {
            task_id: task.task_id.clone(),
            status,
            final_response,
            messages: conv.messages().to_vec(),
            turns: turn,
            api_calls,
            actions,
            error,
        }
    }

    /// 两轮之间：估算 token 超过阈值则压缩
    async fn maybe_compress(&self, conv: &mut Conversation) {
        let compression = &self.settings.compression;
        if !compression.enabled || !self.monitor.should_compress(&conv.to_model_messages()) {
            return;
        }
        self.compress(conv).await;
    }

    async fn compress(&self, conv: &mut Conversation) -> usize {
        let compression = &self.settings.compression;
        let before = crate::memory::TokenEstimator::estimate_messages(&conv.to_model_messages());
        let elided = self
            .compressor
            .compress(conv, compression.protect_first, compression.protect_last)
            .await;
        let after = crate::memory::TokenEstimator::estimate_messages(&conv.to_model_messages());
        tracing::info!(before_tokens = before, after_tokens = after, elided, "context compressed");
        send_event(&self.event_tx, ReactEvent::Compression {
            before_tokens: before,
            after_tokens: after,
            elided,
        });
        elided
    }

    /// 调用模型；按 RecoveryEngine 退避重试，上下文超长时压缩后重试。
    /// 等待模型或退避期间被取消返回 Cancelled，到达截止时间返回 DeadlineExceeded
    async fn call_model(
        &self,
        conv: &mut Conversation,
        schemas: &[ToolSchema],
        api_calls: &mut u32,
        supervisor: &RunSupervisor,
    ) -> Result<ModelResponse, AgentError> {
        let stopped = |supervisor: &RunSupervisor| {
            if supervisor.is_cancelled() {
                AgentError::Cancelled
            } else {
                AgentError::DeadlineExceeded
            }
        };
        let mut attempt: u32 = 0;
        loop {
            let messages = conv.to_model_messages();
            let request = ModelRequest {
                messages: &messages,
                tools: schemas,
            };
            *api_calls += 1;
            let result = tokio::select! {
                r = tokio::time::timeout(self.settings.model_timeout, self.llm.complete(&request)) => match r {
                    Ok(r) => r,
                    Err(_) => Err(LlmError::Timeout(self.settings.model_timeout)),
                },
                _ = supervisor.stopped() => return Err(stopped(supervisor)),
            };
            let err = match result {
                Ok(resp) => return Ok(resp),
                Err(e) => e,
            };
            attempt += 1;

            match self.recovery.handle(&err, attempt) {
                RecoveryAction::RetryAfter(delay) => {
                    tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "model call failed, retrying");
                    send_event(&self.event_tx, ReactEvent::Recovery {
                        action: "RetryAfter".to_string(),
                        detail: format!("{err}; retrying in {delay:?}"),
                    });
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = supervisor.stopped() => return Err(stopped(supervisor)),
                    }
                }
                RecoveryAction::SummarizeAndPrune => {
                    send_event(&self.event_tx, ReactEvent::Recovery {
                        action: "SummarizeAndPrune".to_string(),
                        detail: "Compacting context and retrying".to_string(),
                    });
                    if self.compress(conv).await == 0 {
                        return Err(AgentError::RetriesExhausted { attempts: attempt, last: err });
                    }
                }
                RecoveryAction::Abort => {
                    send_event(&self.event_tx, ReactEvent::Recovery {
                        action: "Abort".to_string(),
                        detail: err.to_string(),
                    });
                    return Err(AgentError::RetriesExhausted { attempts: attempt, last: err });
                }
            }
        }
    }

    /// 校验 + 审批（按请求顺序）
    async fn prepare(&self, call: &ToolCallRequest, caps: &CapabilitySet, run_ctx: &RunContext) -> Prepared {
        send_event(&self.event_tx, ReactEvent::ToolCall {
            tool: call.name.clone(),
            args: call.parse_arguments().unwrap_or(Value::String(call.arguments.clone())),
        });
        let action = match (caps.contains(&call.name), self.registry.get(&call.name)) {
            (true, Some(a)) => a,
            _ => {
                tracing::warn!(tool = %call.name, "requested tool is not available in this run");
                return Prepared::Resolved(ActionError::validation(format!(
                    "tool '{}' is not available in this run. Available tools: {}",
                    call.name,
                    caps.names().join(", ")
                )));
            }
        };
        let args = match call.parse_arguments() {
            Ok(a) => a,
            Err(reason) => return Prepared::Resolved(ActionError::validation(reason)),
        };
        match self.gate.authorize(&action, &args, run_ctx).await {
            Decision::Allow => Prepared::Ready(action, args),
            Decision::Deny { reason } => Prepared::Resolved(ActionError::new(ErrorKind::SafetyDenied, reason)),
        }
    }

    /// 分发一轮中的全部动作。连续的 Independent 动作并发执行（受调度器限制），
    /// Exclusive 动作单独执行；返回值与 calls 一一对应，第二项表示是否因截止时间中断
    async fn dispatch(
        &self,
        calls: &[ToolCallRequest],
        caps: &CapabilitySet,
        run_ctx: &RunContext,
        action_ctx: &ActionContext,
        scheduler: &TaskScheduler,
        supervisor: &RunSupervisor,
    ) -> (Vec<(Result<String, ActionError>, Duration)>, bool) {
        let mut slots: Vec<Option<(Result<String, ActionError>, Duration)>> = Vec::with_capacity(calls.len());
        let mut ready: Vec<Option<(Arc<ActionDescriptor>, Value)>> = Vec::with_capacity(calls.len());
        for call in calls {
            match self.prepare(call, caps, run_ctx).await {
                Prepared::Resolved(e) => {
                    slots.push(Some((Err(e), Duration::ZERO)));
                    ready.push(None);
                }
                Prepared::Ready(action, args) => {
                    slots.push(None);
                    ready.push(Some((action, args)));
                }
            }
        }

        // 分组：连续 Independent 合并，Exclusive 单独成组
        let mut groups: Vec<Vec<usize>> = Vec::new();
        let mut current: Vec<usize> = Vec::new();
        for (i, item) in ready.iter().enumerate() {
            let Some((action, _)) = item else { continue };
            if action.concurrency == Concurrency::Independent {
                current.push(i);
            } else {
                if !current.is_empty() {
                    groups.push(std::mem::take(&mut current));
                }
                groups.push(vec![i]);
            }
        }
        if !current.is_empty() {
            groups.push(current);
        }

        let stop = supervisor.hard_stop();
        tokio::pin!(stop);
        let mut interrupted = false;

        for group in groups {
            if interrupted || supervisor.is_expired() {
                interrupted = true;
                break;
            }
            let mut pending = FuturesUnordered::new();
            for i in group {
                let Some((action, args)) = ready[i].take() else { continue };
                let executor = &self.executor;
                pending.push(async move {
                    let start = Instant::now();
                    let result = match scheduler.acquire_action().await {
                        Ok(_permit) => executor.execute(&action, args, action_ctx).await,
                        Err(e) => Err(ActionError::from(e)),
                    };
                    (i, result, start.elapsed())
                });
            }
            loop {
                tokio::select! {
                    next = pending.next() => match next {
                        Some((i, result, elapsed)) => slots[i] = Some((result, elapsed)),
                        None => break,
                    },
                    _ = &mut stop => {
                        interrupted = true;
                        break;
                    }
                }
            }
        }

        let (kind, message) = if supervisor.is_cancelled() {
            (ErrorKind::Cancelled, "action interrupted: run cancelled")
        } else {
            (ErrorKind::Timeout, "action interrupted: run deadline exceeded")
        };
        let results = slots
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| (Err(ActionError::new(kind, message)), Duration::ZERO)))
            .collect();
        (results, interrupted)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::core::RetryPolicy;
    use crate::llm::MockLlmClient;
    use crate::memory::Role;
    use crate::safety::ApprovalAllowlist;
    use crate::session::EnvironmentConfig;
    use crate::tools::Tool;

    /// 睡眠指定毫秒后返回自身名称与参数
    struct Sleeper {
        name: &'static str,
        concurrency: Concurrency,
    }

    #[async_trait]
    impl Tool for Sleeper {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "sleeps for ms milliseconds"
        }
        fn concurrency(&self) -> Concurrency {
            self.concurrency
        }
        async fn execute(&self, args: Value, _ctx: &ActionContext) -> Result<String, ActionError> {
            let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(format!("{}:{ms}", self.name))
        }
    }

    /// 返回 size 个字符的大段输出
    struct Dump;

    #[async_trait]
    impl Tool for Dump {
        fn name(&self) -> &str {
            "dump"
        }
        fn description(&self) -> &str {
            "prints size characters"
        }
        async fn execute(&self, args: Value, _ctx: &ActionContext) -> Result<String, ActionError> {
            let size = args.get("size").and_then(Value::as_u64).unwrap_or(0) as usize;
            Ok("y".repeat(size))
        }
    }

    fn registry() -> Arc<ToolRegistry> {
        let mut reg = ToolRegistry::new();
        reg.register(Dump);
        reg.register(Sleeper {
            name: "web_extract",
            concurrency: Concurrency::Independent,
        });
        reg.register(Sleeper {
            name: "terminal",
            concurrency: Concurrency::Exclusive,
        });
        Arc::new(reg)
    }

    fn agent(llm: MockLlmClient, settings: LoopSettings) -> AgentLoop {
        let gate = Arc::new(ApprovalGate::non_interactive(Arc::new(ApprovalAllowlist::in_memory())));
        let sessions = Arc::new(SessionManager::new(EnvironmentConfig::default()));
        AgentLoop::new(Arc::new(llm), registry(), gate, sessions, settings)
            .with_recovery(RecoveryEngine::new(RetryPolicy::immediate(3)))
    }

    fn call(id: &str, name: &str, args: Value) -> ToolCallRequest {
        ToolCallRequest::new(id, name, args.to_string())
    }

    fn tight_compression() -> LoopSettings {
        LoopSettings {
            compression: CompressionSettings {
                enabled: true,
                threshold: 0.5,
                protect_first: 2,
                protect_last: 2,
            },
            ..LoopSettings::default()
        }
    }

    fn dump(id: &str) -> Result<ModelResponse, LlmError> {
        Ok(ModelResponse::calls(vec![call(id, "dump", json!({"size": 4000}))]))
    }

    fn tool_contents(outcome: &RunOutcome) -> Vec<&str> {
        outcome
            .messages
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| m.content.as_str())
            .collect()
    }

    #[tokio::test]
    async fn test_action_outside_capabilities_is_rejected_and_run_continues() {
        let llm = MockLlmClient::scripted(vec![
            Ok(ModelResponse::calls(vec![call("c1", "terminal", json!({"ms": 0}))])),
            Ok(ModelResponse::text("done without shell")),
        ]);
        let agent = agent(llm, LoopSettings::default());
        let caps = CapabilitySet::from_actions(["web_extract"]);
        let outcome = agent.run(&RunTask::new("t1", "list files"), &caps, 5).await;

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.final_response, "done without shell");
        let results = tool_contents(&outcome);
        assert_eq!(results.len(), 1);
        assert!(results[0].contains("not available"));
        assert!(results[0].contains("validation"));
        assert_eq!(outcome.actions[0].error_kind, Some(ErrorKind::Validation));
    }

    #[tokio::test]
    async fn test_turn_limit_stops_with_no_answer() {
        let llm = MockLlmClient::new(|_| Ok(ModelResponse::calls(vec![call("c", "web_extract", json!({"ms": 0}))])));
        let agent = agent(llm, LoopSettings::default());
        let caps = CapabilitySet::from_actions(["web_extract"]);
        let outcome = agent.run(&RunTask::new("t2", "loop forever"), &caps, 3).await;

        assert_eq!(outcome.status, RunStatus::TurnLimitReached);
        assert!(outcome.succeeded());
        assert!(!outcome.completed());
        assert_eq!(outcome.api_calls, 3);
        assert_eq!(outcome.turns, 3);
        assert_eq!(outcome.final_response, NO_ANSWER);
    }

    #[tokio::test]
    async fn test_turn_limit_returns_last_assistant_text() {
        let llm = MockLlmClient::new(|_| {
            Ok(ModelResponse {
                content: Some("still digging".into()),
                ..ModelResponse::calls(vec![call("c", "web_extract", json!({"ms": 0}))])
            })
        });
        let agent = agent(llm, LoopSettings::default());
        let caps = CapabilitySet::from_actions(["web_extract"]);
        let outcome = agent.run(&RunTask::new("t2b", "keep going"), &caps, 2).await;

        assert_eq!(outcome.status, RunStatus::TurnLimitReached);
        assert!(outcome.succeeded());
        assert_eq!(outcome.final_response, "still digging");
    }

    #[tokio::test]
    async fn test_duplicate_call_ids_renamed_and_run_continues() {
        let llm = MockLlmClient::scripted(vec![
            Ok(ModelResponse::calls(vec![
                call("call_0", "web_extract", json!({"ms": 0})),
                call("call_0", "web_extract", json!({"ms": 1})),
                call("", "web_extract", json!({"ms": 2})),
            ])),
            Ok(ModelResponse::text("fine")),
        ]);
        let agent = agent(llm, LoopSettings::default());
        let caps = CapabilitySet::from_actions(["web_extract"]);
        let outcome = agent.run(&RunTask::new("t7", "dup ids"), &caps, 5).await;

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.final_response, "fine");
        let ids: Vec<_> = outcome
            .messages
            .iter()
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();
        assert_eq!(ids, vec!["call_0", "call_0_1", "call_1"]);
        assert_eq!(tool_contents(&outcome), vec!["web_extract:0", "web_extract:1", "web_extract:2"]);
    }

    #[test]
    fn test_unique_ids_left_untouched() {
        let mut calls = vec![call("a", "x", json!({})), call("b", "x", json!({}))];
        assert_eq!(ensure_unique_call_ids(&mut calls), 0);
        let mut clash = vec![call("a", "x", json!({})), call("a_1", "x", json!({})), call("a", "x", json!({}))];
        assert_eq!(ensure_unique_call_ids(&mut clash), 1);
        assert_eq!(clash[2].id, "a_2");
    }

    #[tokio::test]
    async fn test_compression_between_turns_keeps_edges() {
        let llm = MockLlmClient::scripted(vec![
            dump("d1"),
            dump("d2"),
            dump("d3"),
            Ok(ModelResponse::text("summarised")),
        ]);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let agent = agent(llm, tight_compression())
            .with_context_length(4000)
            .with_event_tx(tx);
        let caps = CapabilitySet::from_actions(["dump"]);
        let outcome = agent.run(&RunTask::new("t8", "read the logs"), &caps, 10).await;

        assert_eq!(outcome.status, RunStatus::Completed);
        let mut elided_total = 0;
        while let Ok(ev) = rx.try_recv() {
            if let ReactEvent::Compression {
                before_tokens,
                after_tokens,
                elided,
            } = ev
            {
                assert!(after_tokens <= before_tokens);
                elided_total += elided;
            }
        }
        assert!(elided_total >= 1);

        let msgs = &outcome.messages;
        assert_eq!(msgs[1].content, "read the logs");
        assert!(msgs[3].content.starts_with("[earlier action output elided"));
        let results = tool_contents(&outcome);
        assert_eq!(results.last().map(|r| r.len()), Some(4000));
    }

    #[tokio::test]
    async fn test_context_overflow_compresses_and_retries() {
        let llm = MockLlmClient::scripted(vec![
            dump("d1"),
            dump("d2"),
            Err(LlmError::ContextLengthExceeded("maximum context length".into())),
            Ok(ModelResponse::text("recovered")),
        ]);
        let agent = agent(llm, tight_compression());
        let caps = CapabilitySet::from_actions(["dump"]);
        let outcome = agent.run(&RunTask::new("t9", "overflow"), &caps, 10).await;

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.final_response, "recovered");
        assert_eq!(outcome.api_calls, 4);
        assert!(outcome.messages[3].content.starts_with("[earlier action output elided"));
    }

    #[tokio::test]
    async fn test_context_overflow_with_nothing_to_compress_is_fatal() {
        let llm = MockLlmClient::scripted(vec![Err(LlmError::ContextLengthExceeded("too long".into()))]);
        let agent = agent(llm, tight_compression());
        let outcome = agent
            .run(&RunTask::new("t10", "huge prompt"), &CapabilitySet::default(), 5)
            .await;

        assert_eq!(outcome.status, RunStatus::Failed(ErrorKind::Transport));
        assert_eq!(outcome.api_calls, 1);
    }

    #[tokio::test]
    async fn test_cancelled_run_is_not_a_success() {
        let llm = MockLlmClient::echo();
        let token = CancellationToken::new();
        token.cancel();
        let agent = agent(llm, LoopSettings::default()).with_shutdown(token);
        let outcome = agent
            .run(&RunTask::new("t11", "never runs"), &CapabilitySet::default(), 5)
            .await;

        assert_eq!(outcome.status, RunStatus::Failed(ErrorKind::Cancelled));
        assert!(!outcome.succeeded());
        assert_eq!(outcome.api_calls, 0);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_retry_backoff() {
        let llm = MockLlmClient::new(|_| Err(LlmError::Unreachable("connection refused".into())));
        let token = CancellationToken::new();
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 10_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        };
        let agent = agent(llm, LoopSettings::default())
            .with_recovery(RecoveryEngine::new(policy))
            .with_shutdown(token.clone());
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });
        let started = Instant::now();
        let outcome = agent
            .run(&RunTask::new("t12", "hello"), &CapabilitySet::default(), 5)
            .await;
        canceller.await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(outcome.status, RunStatus::Failed(ErrorKind::Cancelled));
        assert_eq!(outcome.api_calls, 1);
    }

    #[tokio::test]
    async fn test_results_appended_in_request_order() {
        let llm = MockLlmClient::scripted(vec![
            Ok(ModelResponse::calls(vec![
                call("a", "web_extract", json!({"ms": 60})),
                call("b", "web_extract", json!({"ms": 5})),
                call("c", "terminal", json!({"ms": 0})),
                call("d", "web_extract", json!({"ms": 0})),
            ])),
            Ok(ModelResponse::text("ok")),
        ]);
        let settings = LoopSettings {
            max_concurrent_actions: 4,
            ..LoopSettings::default()
        };
        let agent = agent(llm, settings);
        let caps = CapabilitySet::from_actions(["web_extract", "terminal"]);
        let outcome = agent.run(&RunTask::new("t3", "fan out"), &caps, 5).await;

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(
            tool_contents(&outcome),
            vec!["web_extract:60", "web_extract:5", "terminal:0", "web_extract:0"]
        );
        let ids: Vec<_> = outcome
            .messages
            .iter()
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn test_transport_failure_exhausts_retries() {
        let llm = MockLlmClient::new(|_| Err(LlmError::Unreachable("connection refused".into())));
        let agent = agent(llm, LoopSettings::default());
        let outcome = agent
            .run(&RunTask::new("t4", "hello"), &CapabilitySet::default(), 5)
            .await;

        assert_eq!(outcome.status, RunStatus::Failed(ErrorKind::Transport));
        assert_eq!(outcome.api_calls, 3);
        assert_eq!(outcome.final_response, NO_ANSWER);
        assert!(outcome.error.as_deref().unwrap_or_default().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_ephemeral_instruction_not_exported() {
        let llm = MockLlmClient::new(|req| {
            let system = &req.messages[0].content;
            if system.contains("answer in French") {
                Ok(ModelResponse::text("bonjour"))
            } else {
                Ok(ModelResponse::text("hello"))
            }
        });
        let agent = agent(llm, LoopSettings::default());
        let task = RunTask::new("t5", "greet").with_ephemeral(Some("answer in French".into()));
        let outcome = agent.run(&task, &CapabilitySet::default(), 2).await;

        assert_eq!(outcome.final_response, "bonjour");
        assert!(outcome.messages.iter().all(|m| !m.content.contains("answer in French")));
        let traj = outcome.trajectory();
        assert_eq!(traj.first().map(|t| t.from.as_str()), Some("system"));
    }

    #[tokio::test]
    async fn test_deadline_interrupts_slow_action() {
        let llm = MockLlmClient::new(|_| Ok(ModelResponse::calls(vec![call("s", "web_extract", json!({"ms": 5000}))])));
        let settings = LoopSettings {
            run_timeout: Some(Duration::from_millis(50)),
            grace_period: Duration::from_millis(10),
            ..LoopSettings::default()
        };
        let agent = agent(llm, settings);
        let caps = CapabilitySet::from_actions(["web_extract"]);
        let started = Instant::now();
        let outcome = agent.run(&RunTask::new("t6", "slow"), &caps, 10).await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(outcome.status, RunStatus::TurnLimitReached);
        assert_eq!(outcome.actions.len(), 1);
        assert_eq!(outcome.actions[0].error_kind, Some(ErrorKind::Timeout));
        assert!(tool_contents(&outcome)[0].contains("interrupted"));
    }
}
