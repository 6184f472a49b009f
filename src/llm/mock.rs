//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 三种用法：echo（回显最后一条 user 消息）、scripted（按顺序返回预设响应）、
//! new（自定义处理函数，可按 prompt 区分任务）。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError, ModelRequest, ModelResponse};
use crate::memory::Role;

type Handler = dyn Fn(&ModelRequest<'_>) -> Result<ModelResponse, LlmError> + Send + Sync;

pub struct MockLlmClient {
    handler: Arc<Handler>,
    calls: AtomicU64,
}

impl MockLlmClient {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&ModelRequest<'_>) -> Result<ModelResponse, LlmError> + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            calls: AtomicU64::new(0),
        }
    }

    /// 回显最后一条 user 消息作为最终回答
    pub fn echo() -> Self {
        Self::new(|req| {
            let last_user = last_user_prompt(req).unwrap_or("(no input)");
            Ok(ModelResponse::text(format!("Echo from Mock: {last_user}")))
        })
    }

    /// 按顺序返回预设响应；耗尽后返回固定文本
    pub fn scripted(responses: Vec<Result<ModelResponse, LlmError>>) -> Self {
        let queue = Mutex::new(VecDeque::from(responses));
        Self::new(move |_| {
            let next = queue.lock().ok().and_then(|mut q| q.pop_front());
            next.unwrap_or_else(|| Ok(ModelResponse::text("(script exhausted)")))
        })
    }

    /// 已收到的 complete 调用次数
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::echo()
    }
}

/// 请求中第一条 user 消息（任务 prompt）
pub fn first_user_prompt<'a>(req: &ModelRequest<'a>) -> Option<&'a str> {
    req.messages
        .iter()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
}

fn last_user_prompt<'a>(req: &ModelRequest<'a>) -> Option<&'a str> {
    req.messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, request: &ModelRequest<'_>) -> Result<ModelResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        (self.handler)(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Message;

    #[tokio::test]
    async fn test_echo() {
        let client = MockLlmClient::echo();
        let messages = vec![Message::system("s"), Message::user("ping")];
        let resp = client
            .complete(&ModelRequest {
                messages: &messages,
                tools: &[],
            })
            .await
            .unwrap();
        assert_eq!(resp.content.as_deref(), Some("Echo from Mock: ping"));
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn test_scripted_in_order() {
        let client = MockLlmClient::scripted(vec![
            Err(LlmError::Unreachable("down".into())),
            Ok(ModelResponse::text("ok")),
        ]);
        let messages = vec![Message::user("x")];
        let req = ModelRequest {
            messages: &messages,
            tools: &[],
        };
        assert!(client.complete(&req).await.is_err());
        assert_eq!(client.complete(&req).await.unwrap().content.as_deref(), Some("ok"));
        assert_eq!(
            client.complete(&req).await.unwrap().content.as_deref(),
            Some("(script exhausted)")
        );
    }
}
