//! 错误恢复引擎与重试策略
//!
//! RetryPolicy 是显式配置数据（最大尝试次数、基础延迟、上限、倍率），
//! RecoveryEngine 根据 LlmError 与当前尝试次数返回 RecoveryAction，供执行循环决定退避重试、压缩上下文还是终止。

use std::time::Duration;

use serde::Deserialize;

use crate::core::RecoveryAction;
use crate::llm::LlmError;

/// 模型调用重试策略（对应配置 [llm.retry]）
///
/// | 字段 | 作用 |
/// |------|------|
/// | `max_attempts` | 单次模型调用的总尝试次数（含首次），耗尽即 FatalError |
/// | `base_delay_ms` | 第一次重试前的等待 |
/// | `multiplier` | 每次重试等待的放大倍率（指数退避） |
/// | `max_delay_ms` | 单次等待上限 |
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// 不等待、立即重试的策略（测试用）
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
        }
    }

    /// 第 attempt 次失败后（从 1 开始）的退避时间
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16) as i32;
        let ms = (self.base_delay_ms as f64) * self.multiplier.max(1.0).powi(exp);
        let ms = ms.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(ms as u64)
    }
}

/// 语义化错误恢复：将模型调用错误映射为可执行动作（退避重试 / 压缩 / 终止）
#[derive(Debug, Default, Clone)]
pub struct RecoveryEngine {
    policy: RetryPolicy,
}

impl RecoveryEngine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// attempt 为已失败的尝试次数（从 1 开始）
    pub fn handle(&self, err: &LlmError, attempt: u32) -> RecoveryAction {
        if attempt >= self.policy.max_attempts {
            return RecoveryAction::Abort;
        }
        match err {
            LlmError::ContextLengthExceeded(_) => RecoveryAction::SummarizeAndPrune,
            LlmError::RateLimited {
                retry_after_ms: Some(ms),
            } => {
                let hinted = Duration::from_millis(*ms);
                let cap = Duration::from_millis(self.policy.max_delay_ms);
                RecoveryAction::RetryAfter(hinted.max(self.policy.delay_for(attempt)).min(cap))
            }
            e if e.is_retryable() => RecoveryAction::RetryAfter(self.policy.delay_for(attempt)),
            _ => RecoveryAction::Abort,
        }
    }
}
