//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient：一次 complete 即一次模型往返，
//! 返回文本、动作调用与可选的推理内容。错误分类决定执行循环的恢复策略。

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::memory::{Message, ToolCallRequest};

/// 模型调用错误
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LlmError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("rate limited (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("server error {status}: {body}")]
    Server { status: u16, body: String },

    /// 4xx（除 429）：鉴权失败、请求格式错误等，重试无意义
    #[error("request rejected {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("context length exceeded: {0}")]
    ContextLengthExceeded(String),

    /// 响应无法解析（空 choices、非法 JSON 等）
    #[error("malformed response: {0}")]
    Decode(String),
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::Timeout(_)
                | LlmError::Unreachable(_)
                | LlmError::RateLimited { .. }
                | LlmError::Server { .. }
                | LlmError::Decode(_)
        )
    }
}

/// 暴露给模型的动作 schema（OpenAI function 格式）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 一次模型请求：消息 + 当前能力集的动作 schema
#[derive(Debug, Clone, Copy)]
pub struct ModelRequest<'a> {
    pub messages: &'a [Message],
    pub tools: &'a [ToolSchema],
}

/// 一次模型响应
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub reasoning: Option<String>,
}

impl ModelResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn calls(tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            tool_calls,
            ..Default::default()
        }
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: &ModelRequest<'_>) -> Result<ModelResponse, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
