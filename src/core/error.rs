//! Agent 错误类型、错误分类与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 LlmError 决定 RetryAfter / SummarizeAndPrune / Abort；
//! ErrorKind 是稳定的可序列化分类，用于批量统计中的 failed-by-kind 与输出记录。

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::LlmError;
use crate::toolsets::ToolsetError;

/// 错误分类（写入输出记录与统计，字段名保持稳定）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 模型或动作调用不可达 / 超时，且重试已耗尽
    Transport,
    /// 动作不在能力集内、参数格式错误
    Validation,
    /// 审批闸门拒绝
    SafetyDenied,
    /// 动作自身执行失败
    ActionFailed,
    /// 动作执行超时
    Timeout,
    /// 会话环境创建 / 使用失败
    Session,
    /// 工作任务 panic
    Panic,
    /// 外部取消（Ctrl+C），任务未跑完，续跑时会重新执行
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Validation => "validation",
            ErrorKind::SafetyDenied => "safety_denied",
            ErrorKind::ActionFailed => "action_failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Session => "session",
            ErrorKind::Panic => "panic",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Agent 运行过程中可能出现的错误（传输、校验、安全拒绝、任务级失败）
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("LLM error: {0}")]
    LlmError(#[from] LlmError),

    /// 重试预算耗尽后的传输失败，终止当前循环
    #[error("LLM call failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: LlmError },

    #[error("Tool not available in this run: {0}")]
    ToolNotAvailable(String),

    #[error("Invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Approval denied: {0}")]
    ApprovalDenied(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Toolset resolution failed: {0}")]
    Toolset(#[from] ToolsetError),

    #[error("Task panicked: {0}")]
    Panicked(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Run cancelled")]
    Cancelled,

    /// 等待模型期间到达截止时间；循环将其作为 TurnLimitReached 处理
    #[error("Run deadline exceeded")]
    DeadlineExceeded,
}

impl AgentError {
    /// 映射为稳定分类
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::LlmError(_) | AgentError::RetriesExhausted { .. } => ErrorKind::Transport,
            AgentError::ToolNotAvailable(_) | AgentError::InvalidArguments { .. } => {
                ErrorKind::Validation
            }
            AgentError::ToolExecutionFailed(_) => ErrorKind::ActionFailed,
            AgentError::ToolTimeout(_) => ErrorKind::Timeout,
            AgentError::ApprovalDenied(_) => ErrorKind::SafetyDenied,
            AgentError::Session(_) => ErrorKind::Session,
            AgentError::Panicked(_) => ErrorKind::Panic,
            AgentError::Cancelled => ErrorKind::Cancelled,
            AgentError::DeadlineExceeded => ErrorKind::Timeout,
            AgentError::Toolset(_) | AgentError::ConfigError(_) => ErrorKind::Internal,
        }
    }
}

/// 恢复引擎根据模型调用错误给出的建议动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 等待退避时间后重试同一请求
    RetryAfter(Duration),
    /// 压缩上下文后重试（模型报告上下文超长）
    SummarizeAndPrune,
    /// 终止当前任务
    Abort,
}
