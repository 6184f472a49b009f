//! OpenAI 兼容 API 客户端
//!
//! 直接以 reqwest 调用任意 OpenAI 兼容端点的 /chat/completions（可配置 base_url），
//! 支持 function calling 与 reasoning_content；HTTP 状态映射为 LlmError 以驱动恢复策略。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::llm::{LlmClient, LlmError, ModelRequest, ModelResponse, ToolSchema};
use crate::memory::{Message, Role, ToolCallRequest};

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: WireMessage,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
    #[serde(alias = "reasoning")]
    reasoning_content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// OpenAI 兼容客户端：持有 HTTP Client、端点与 model 名
pub struct OpenAiClient {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    request_timeout: Duration,
    /// 累计 token 使用统计
    pub usage: TokenUsage,
}

impl OpenAiClient {
    pub fn new(base_url: &str, model: &str, api_key: Option<String>, request_timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model: model.to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
            request_timeout,
            usage: TokenUsage::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn request_body(&self, request: &ModelRequest<'_>) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": request.messages.iter().map(to_wire_message).collect::<Vec<_>>(),
        });
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(request.tools.iter().map(to_wire_tool).collect());
        }
        body
    }

    fn map_send_error(&self, e: reqwest::Error) -> LlmError {
        if e.is_timeout() {
            LlmError::Timeout(self.request_timeout)
        } else {
            LlmError::Unreachable(e.to_string())
        }
    }
}

fn to_wire_message(m: &Message) -> Value {
    match m.role {
        Role::System => json!({ "role": "system", "content": m.content }),
        Role::User => json!({ "role": "user", "content": m.content }),
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": m.tool_call_id.as_deref().unwrap_or_default(),
            "content": m.content,
        }),
        Role::Assistant if m.tool_calls.is_empty() => {
            json!({ "role": "assistant", "content": m.content })
        }
        Role::Assistant => {
            let calls: Vec<Value> = m
                .tool_calls
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "type": "function",
                        "function": { "name": c.name, "arguments": c.arguments },
                    })
                })
                .collect();
            let content = if m.content.is_empty() {
                Value::Null
            } else {
                Value::String(m.content.clone())
            };
            json!({ "role": "assistant", "content": content, "tool_calls": calls })
        }
    }
}

fn to_wire_tool(t: &ToolSchema) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": t.name,
            "description": t.description,
            "parameters": t.parameters,
        }
    })
}

/// 将非 2xx 状态映射为 LlmError
pub(crate) fn classify_status(status: StatusCode, retry_after: Option<u64>, body: String) -> LlmError {
    let code = status.as_u16();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return LlmError::RateLimited {
            retry_after_ms: retry_after.map(|s| s * 1000),
        };
    }
    if status.is_server_error() {
        return LlmError::Server { status: code, body };
    }
    let lower = body.to_lowercase();
    if lower.contains("context_length")
        || lower.contains("maximum context length")
        || lower.contains("context window")
        || lower.contains("too many tokens")
    {
        return LlmError::ContextLengthExceeded(body);
    }
    LlmError::Rejected { status: code, body }
}

fn into_response(parsed: ChatResponse) -> Result<(ModelResponse, Option<Usage>), LlmError> {
    let ChatResponse { choices, usage } = parsed;
    let choice = choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::Decode("response has no choices".to_string()))?;
    let msg = choice.message;
    let tool_calls = msg
        .tool_calls
        .into_iter()
        .map(|c| {
            let id = if c.id.is_empty() {
                format!("call_{}", uuid::Uuid::new_v4().simple())
            } else {
                c.id
            };
            ToolCallRequest::new(id, c.function.name, c.function.arguments)
        })
        .collect();
    Ok((
        ModelResponse {
            content: msg.content,
            tool_calls,
            reasoning: msg.reasoning_content.filter(|r| !r.trim().is_empty()),
        },
        usage,
    ))
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    async fn complete(&self, request: &ModelRequest<'_>) -> Result<ModelResponse, LlmError> {
        let mut req = self.client.post(&self.endpoint).json(&self.request_body(request));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await.map_err(|e| self.map_send_error(e))?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, body));
        }

        let text = resp.text().await.map_err(|e| self.map_send_error(e))?;
        let parsed: ChatResponse =
            serde_json::from_str(&text).map_err(|e| LlmError::Decode(e.to_string()))?;
        let (response, usage) = into_response(parsed)?;

        // 提取 token 使用统计
        if let Some(u) = usage {
            self.usage.add(u.prompt_tokens, u.completion_tokens);
        }
        tracing::debug!(
            model = %self.model,
            tool_calls = response.tool_calls.len(),
            "chat completion received"
        );
        Ok(response)
    }
}
