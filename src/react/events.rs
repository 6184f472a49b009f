//! 执行过程事件：用于 CLI 实时展示步数、推理、动作调用、观察与最终回复

use serde::Serialize;

/// 单步过程事件（可序列化为 JSON）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReactEvent {
    /// 当前第几轮
    StepUpdate { step: usize, max_steps: usize },
    /// 正在调用模型
    Thinking,
    /// 模型返回的推理内容（预览）
    ThinkingContent { text: String },
    /// 调用动作
    ToolCall {
        tool: String,
        args: serde_json::Value,
    },
    /// 动作返回（预览，避免过长）
    Observation { tool: String, preview: String },
    /// 动作失败（包括校验拒绝与超时）
    ToolFailure { tool: String, reason: String },
    /// 审批闸门拒绝
    ApprovalDenied { tool: String, reason: String },
    /// 错误恢复动作（RetryAfter / SummarizeAndPrune / Abort）
    Recovery { action: String, detail: String },
    /// 上下文压缩
    Compression {
        before_tokens: usize,
        after_tokens: usize,
        elided: usize,
    },
    /// 最终回复
    Final { text: String, completed: bool },
    /// Token 使用统计（累计）
    TokenUsage {
        prompt_tokens: u64,
        completion_tokens: u64,
        total_tokens: u64,
    },
    /// 错误
    Error { text: String },
}
