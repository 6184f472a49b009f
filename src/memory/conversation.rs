//! 对话：单个 Execution Loop 独占的有序轮次序列
//!
//! 不变式：第一条永远是 system；每条动作结果（Role::Tool）紧跟在请求它的 assistant 轮之后
//! （同一批结果之间可连续），并通过唯一的 call id 引用该请求。
//! 临时指令（ephemeral）单独保存：发给模型时拼入 system，导出轨迹时不出现。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// 消息角色（与 OpenAI 兼容 API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// 模型请求的单次动作调用；arguments 为模型给出的原始 JSON 字符串
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    /// 解析参数：空串视为 {}，必须是 JSON 对象
    pub fn parse_arguments(&self) -> Result<Value, String> {
        let raw = self.arguments.trim();
        if raw.is_empty() {
            return Ok(Value::Object(Default::default()));
        }
        match serde_json::from_str::<Value>(raw) {
            Ok(v @ Value::Object(_)) => Ok(v),
            Ok(other) => Err(format!("arguments must be a JSON object, got {}", json_type(&other))),
            Err(e) => Err(format!("arguments are not valid JSON: {e}")),
        }
    }
}

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// 模型返回的推理内容：保留用于导出，永不作为最终回答
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl Message {
    fn plain(role: Role, content: String) -> Self {
        Self {
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
            reasoning: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content.into())
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content.into())
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content.into())
    }

    pub fn assistant_with_calls(
        content: impl Into<String>,
        tool_calls: Vec<ToolCallRequest>,
        reasoning: Option<String>,
    ) -> Self {
        Self {
            tool_calls,
            reasoning,
            ..Self::plain(Role::Assistant, content.into())
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            ..Self::plain(Role::Tool, content.into())
        }
    }

    /// 估算用的字符总量（content + 调用参数 + 推理）
    pub fn char_len(&self) -> usize {
        self.content.chars().count()
            + self
                .tool_calls
                .iter()
                .map(|c| c.name.len() + c.arguments.chars().count())
                .sum::<usize>()
            + self.reasoning.as_ref().map(|r| r.chars().count()).unwrap_or(0)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConversationError {
    #[error("tool result for call '{0}' does not follow an assistant turn that requested it")]
    OrphanToolResult(String),
    #[error("duplicate tool call id '{0}'")]
    DuplicateCallId(String),
}

/// 对话：system + user 起始，随后 assistant / tool 交替
#[derive(Clone, Debug)]
pub struct Conversation {
    messages: Vec<Message>,
    ephemeral: Option<String>,
    /// 最近一次 assistant 轮请求、尚未写回结果的 call id（按请求顺序）
    pending_calls: Vec<String>,
}

impl Conversation {
    pub fn new(system_prompt: impl Into<String>, ephemeral: Option<String>, user_prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::system(system_prompt), Message::user(user_prompt)],
            ephemeral: ephemeral.filter(|e| !e.trim().is_empty()),
            pending_calls: Vec::new(),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn ephemeral(&self) -> Option<&str> {
        self.ephemeral.as_deref()
    }

    /// 追加 assistant 轮；其 tool_calls 成为待写回结果
    pub fn push_assistant(&mut self, msg: Message) -> Result<(), ConversationError> {
        let mut ids: Vec<String> = Vec::with_capacity(msg.tool_calls.len());
        for call in &msg.tool_calls {
            if ids.contains(&call.id) {
                return Err(ConversationError::DuplicateCallId(call.id.clone()));
            }
            ids.push(call.id.clone());
        }
        self.pending_calls = ids;
        self.messages.push(Message {
            role: Role::Assistant,
            ..msg
        });
        Ok(())
    }

    /// 追加动作结果；call_id 必须是上一个 assistant 轮中尚未回答的请求
    pub fn push_tool_result(
        &mut self,
        call_id: &str,
        content: impl Into<String>,
    ) -> Result<(), ConversationError> {
        let follows_assistant = matches!(
            self.messages.last().map(|m| m.role),
            Some(Role::Assistant) | Some(Role::Tool)
        );
        let pos = self.pending_calls.iter().position(|id| id == call_id);
        match (follows_assistant, pos) {
            (true, Some(idx)) => {
                self.pending_calls.remove(idx);
                self.messages.push(Message::tool_result(call_id, content));
                Ok(())
            }
            _ => Err(ConversationError::OrphanToolResult(call_id.to_string())),
        }
    }

    /// 发给模型的消息：system 中拼入临时指令
    pub fn to_model_messages(&self) -> Vec<Message> {
        let mut out = self.messages.clone();
        if let (Some(eph), Some(first)) = (&self.ephemeral, out.first_mut()) {
            first.content = format!("{}\n\n{}", first.content, eph);
        }
        out
    }

    /// 最后一条非空 assistant 文本
    pub fn last_assistant_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .filter(|m| m.role == Role::Assistant)
            .map(|m| m.content.trim())
            .find(|c| !c.is_empty())
    }

    /// 动作结果轮的下标（供上下文压缩使用）
    pub fn tool_result_indices(&self) -> Vec<usize> {
        self.messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.role == Role::Tool)
            .map(|(i, _)| i)
            .collect()
    }

    /// 替换某条动作结果的内容；非 Tool 轮不允许改写
    pub fn replace_tool_content(&mut self, index: usize, content: impl Into<String>) -> bool {
        match self.messages.get_mut(index) {
            Some(m) if m.role == Role::Tool => {
                m.content = content.into();
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(id: &str) -> ToolCallRequest {
        ToolCallRequest::new(id, "web_search", r#"{"query":"rust"}"#)
    }

    #[test]
    fn test_starts_with_system_then_user() {
        let conv = Conversation::new("sys", None, "hello");
        assert_eq!(conv.messages()[0].role, Role::System);
        assert_eq!(conv.messages()[1].role, Role::User);
    }

    #[test]
    fn test_tool_result_must_reference_pending_call() {
        let mut conv = Conversation::new("sys", None, "hi");
        assert_eq!(
            conv.push_tool_result("call_1", "x"),
            Err(ConversationError::OrphanToolResult("call_1".into()))
        );
        conv.push_assistant(Message::assistant_with_calls("", vec![call("call_1"), call("call_2")], None))
            .unwrap();
        conv.push_tool_result("call_1", "a").unwrap();
        conv.push_tool_result("call_2", "b").unwrap();
        assert!(conv.push_tool_result("call_2", "again").is_err());
    }

    #[test]
    fn test_duplicate_call_ids_rejected() {
        let mut conv = Conversation::new("sys", None, "hi");
        let err = conv
            .push_assistant(Message::assistant_with_calls("", vec![call("c"), call("c")], None))
            .unwrap_err();
        assert_eq!(err, ConversationError::DuplicateCallId("c".into()));
    }

    #[test]
    fn test_ephemeral_only_in_model_messages() {
        let conv = Conversation::new("base", Some("be terse".into()), "hi");
        assert_eq!(conv.messages()[0].content, "base");
        assert_eq!(conv.to_model_messages()[0].content, "base\n\nbe terse");
    }

    #[test]
    fn test_parse_arguments() {
        assert!(ToolCallRequest::new("1", "t", "").parse_arguments().unwrap().is_object());
        assert!(ToolCallRequest::new("1", "t", "[1]").parse_arguments().is_err());
        assert!(ToolCallRequest::new("1", "t", "{oops").parse_arguments().is_err());
    }

    #[test]
    fn test_last_assistant_text_skips_empty() {
        let mut conv = Conversation::new("sys", None, "hi");
        conv.push_assistant(Message::assistant("partial")).unwrap();
        conv.push_assistant(Message::assistant_with_calls("", vec![call("c1")], None))
            .unwrap();
        assert_eq!(conv.last_assistant_text(), Some("partial"));
    }
}
