//! 轨迹导出（ShareGPT 风格）
//!
//! system → `system`，user → `human`，assistant → `gpt`（推理放在 `<think>` 中，调用放在 `<tool_call>` 中），
//! 连续的动作结果合并为一条 `tool`（每条结果包在 `<tool_response>` 中）。临时指令不导出。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::memory::{Message, Role};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryTurn {
    pub from: String,
    pub value: String,
}

impl TrajectoryTurn {
    fn new(from: &str, value: String) -> Self {
        Self {
            from: from.to_string(),
            value,
        }
    }
}

pub fn to_trajectory(messages: &[Message]) -> Vec<TrajectoryTurn> {
    let mut out: Vec<TrajectoryTurn> = Vec::with_capacity(messages.len());
    let mut call_names: HashMap<&str, &str> = HashMap::new();
    let mut tool_buf: Vec<String> = Vec::new();

    for msg in messages {
        if msg.role != Role::Tool && !tool_buf.is_empty() {
            out.push(TrajectoryTurn::new("tool", tool_buf.join("\n")));
            tool_buf.clear();
        }
        match msg.role {
            Role::System => out.push(TrajectoryTurn::new("system", msg.content.clone())),
            Role::User => out.push(TrajectoryTurn::new("human", msg.content.clone())),
            Role::Assistant => {
                for call in &msg.tool_calls {
                    call_names.insert(call.id.as_str(), call.name.as_str());
                }
                out.push(TrajectoryTurn::new("gpt", render_assistant(msg)));
            }
            Role::Tool => {
                let id = msg.tool_call_id.as_deref().unwrap_or_default();
                let name = call_names.get(id).copied().unwrap_or_default();
                let body = json!({
                    "tool_call_id": id,
                    "name": name,
                    "content": msg.content,
                });
                tool_buf.push(format!("<tool_response>\n{body}\n</tool_response>"));
            }
        }
    }
    if !tool_buf.is_empty() {
        out.push(TrajectoryTurn::new("tool", tool_buf.join("\n")));
    }
    out
}

fn render_assistant(msg: &Message) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Some(r) = msg.reasoning.as_deref().filter(|r| !r.trim().is_empty()) {
        parts.push(format!("<think>\n{}\n</think>", r.trim()));
    }
    if !msg.content.trim().is_empty() {
        parts.push(msg.content.trim().to_string());
    }
    for call in &msg.tool_calls {
        let args = call
            .parse_arguments()
            .unwrap_or_else(|_| serde_json::Value::String(call.arguments.clone()));
        let body = json!({ "name": call.name, "arguments": args });
        parts.push(format!("<tool_call>\n{body}\n</tool_call>"));
    }
    parts.join("\n")
}
