//! 上下文预算：Token 估算与压缩阈值判断
//!
//! 对话估算 token 超过 `threshold × context_length` 时，执行循环在两轮之间触发压缩。

use crate::memory::Message;

/// Token 估算器（简单的字符计数近似）
pub struct TokenEstimator;

impl TokenEstimator {
    /// 估算文本的 token 数量
    /// 英文约 4 字符/token，中文约 1.5 字符/token
    pub fn estimate(text: &str) -> usize {
        let (ascii, non_ascii) = text.chars().fold((0usize, 0usize), |(a, n), c| {
            if c.is_ascii() {
                (a + 1, n)
            } else {
                (a, n + 1)
            }
        });
        (ascii / 4 + (non_ascii as f64 / 1.5).ceil() as usize).max(1)
    }

    /// 单条消息：content + 调用参数 + 推理，另加每条约 4 token 的结构开销
    pub fn estimate_message(msg: &Message) -> usize {
        let mut tokens = Self::estimate(&msg.content) + 4;
        for call in &msg.tool_calls {
            tokens += Self::estimate(&call.name) + Self::estimate(&call.arguments);
        }
        if let Some(r) = &msg.reasoning {
            tokens += Self::estimate(r);
        }
        tokens
    }

    pub fn estimate_messages(messages: &[Message]) -> usize {
        messages.iter().map(Self::estimate_message).sum()
    }
}

/// 上下文监视器：判断对话是否接近模型上下文上限
#[derive(Debug, Clone)]
pub struct ContextMonitor {
    context_length: usize,
    threshold: f64,
}

impl ContextMonitor {
    pub fn new(context_length: usize, threshold: f64) -> Self {
        Self {
            context_length,
            threshold: threshold.clamp(0.05, 1.0),
        }
    }

    /// 触发压缩的 token 数
    pub fn threshold_tokens(&self) -> usize {
        (self.context_length as f64 * self.threshold) as usize
    }

    pub fn should_compress(&self, messages: &[Message]) -> bool {
        TokenEstimator::estimate_messages(messages) >= self.threshold_tokens()
    }
}

impl Default for ContextMonitor {
    fn default() -> Self {
        Self::new(128_000, 0.85)
    }
}
