//! 上下文压缩
//!
//! 只在两轮之间执行：把中段较长的动作结果替换为摘要，最早的 protect_first 条与最近的 protect_last 条保持原样。
//! 具体摘要方式通过 ContextCompressor 注入，默认实现为截取开头片段。

use async_trait::async_trait;
use serde::Deserialize;

use crate::memory::Conversation;

/// 压缩配置（对应配置 [agent.compression]）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompressionSettings {
    pub enabled: bool,
    /// 触发压缩的上下文占比
    pub threshold: f64,
    pub protect_first: usize,
    pub protect_last: usize,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.85,
            protect_first: 3,
            protect_last: 4,
        }
    }
}

/// 压缩器：返回被摘要替换的轮数
#[async_trait]
pub trait ContextCompressor: Send + Sync {
    async fn compress(&self, conversation: &mut Conversation, protect_first: usize, protect_last: usize) -> usize;
}

/// 默认压缩器：保留开头 preview_chars 个字符，其余省略
#[derive(Debug, Clone)]
pub struct ElidingCompressor {
    preview_chars: usize,
}

impl ElidingCompressor {
    pub fn new(preview_chars: usize) -> Self {
        Self { preview_chars }
    }
}

impl Default for ElidingCompressor {
    fn default() -> Self {
        Self::new(200)
    }
}

const ELIDED_MARKER: &str = "[earlier action output elided";

#[async_trait]
impl ContextCompressor for ElidingCompressor {
    async fn compress(&self, conversation: &mut Conversation, protect_first: usize, protect_last: usize) -> usize {
        let len = conversation.len();
        if len <= protect_first + protect_last {
            return 0;
        }
        let upper = len - protect_last;
        let targets: Vec<(usize, String)> = conversation
            .tool_result_indices()
            .into_iter()
            .filter(|i| *i >= protect_first && *i < upper)
            .filter_map(|i| {
                let content = &conversation.messages()[i].content;
                let total = content.chars().count();
                if content.starts_with(ELIDED_MARKER) || total <= self.preview_chars {
                    return None;
                }
                let head: String = content.chars().take(self.preview_chars).collect();
                Some((i, format!("{ELIDED_MARKER}: {total} chars]\n{head}...")))
            })
            .collect();

        let mut count = 0;
        for (i, summary) in targets {
            if conversation.replace_tool_content(i, summary) {
                count += 1;
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Message, ToolCallRequest};

    fn conversation_with_results(n: usize, size: usize) -> Conversation {
        let mut conv = Conversation::new("sys", None, "task");
        for i in 0..n {
            let id = format!("c{i}");
            conv.push_assistant(Message::assistant_with_calls(
                "",
                vec![ToolCallRequest::new(&id, "web_extract", "{}")],
                None,
            ))
            .unwrap();
            conv.push_tool_result(&id, "x".repeat(size)).unwrap();
        }
        conv
    }

    #[tokio::test]
    async fn test_middle_results_elided_edges_kept() {
        let mut conv = conversation_with_results(5, 1000);
        let compressor = ElidingCompressor::new(10);
        let n = compressor.compress(&mut conv, 3, 4).await;
        // 12 条：0 system, 1 user, 之后 assistant/tool 交替；下标 3、5、7 在保护区之外
        assert_eq!(n, 3);
        let msgs = conv.messages();
        assert!(msgs[3].content.starts_with(ELIDED_MARKER));
        assert!(msgs[7].content.starts_with(ELIDED_MARKER));
        assert_eq!(msgs[9].content.len(), 1000);
        assert_eq!(msgs[11].content.len(), 1000);

        // 已压缩的不重复压缩
        assert_eq!(compressor.compress(&mut conv, 3, 4).await, 0);
    }

    #[tokio::test]
    async fn test_short_conversation_untouched() {
        let mut conv = conversation_with_results(1, 1000);
        assert_eq!(ElidingCompressor::new(10).compress(&mut conv, 3, 4).await, 0);
    }
}
