//! 终端交互审批（`hive run` 使用）
//!
//! 提示写到 stderr，从 stdin 读一行；并发请求串行化，避免提示交错。stdin 关闭视为无交互通道。

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use crate::safety::{ApprovalPrompt, ApprovalRequest, ApprovalScope};

#[derive(Debug, Default)]
pub struct StdinPrompt {
    lock: Mutex<()>,
}

impl StdinPrompt {
    pub fn new() -> Self {
        Self::default()
    }
}

/// 解析用户输入；无法识别的输入按拒绝处理
pub fn parse_answer(line: &str) -> ApprovalScope {
    match line.trim().to_lowercase().as_str() {
        "o" | "once" | "y" | "yes" => ApprovalScope::Once,
        "s" | "session" => ApprovalScope::Session,
        "a" | "always" => ApprovalScope::Always,
        _ => ApprovalScope::Deny,
    }
}

#[async_trait]
impl ApprovalPrompt for StdinPrompt {
    async fn ask(&self, request: &ApprovalRequest<'_>) -> Option<ApprovalScope> {
        let _guard = self.lock.lock().await;
        let mut stderr = tokio::io::stderr();
        let text = format!(
            "\n⚠️  {} ({})\n    command: {}\n    allow? [o]nce / [s]ession / [a]lways / [d]eny: ",
            request.description,
            request.action,
            request.command.unwrap_or("-"),
        );
        stderr.write_all(text.as_bytes()).await.ok()?;
        stderr.flush().await.ok()?;

        let mut line = String::new();
        let n = BufReader::new(tokio::io::stdin()).read_line(&mut line).await.ok()?;
        if n == 0 {
            return None;
        }
        Some(parse_answer(&line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_answer() {
        assert_eq!(parse_answer("o\n"), ApprovalScope::Once);
        assert_eq!(parse_answer(" Session "), ApprovalScope::Session);
        assert_eq!(parse_answer("a"), ApprovalScope::Always);
        assert_eq!(parse_answer(""), ApprovalScope::Deny);
        assert_eq!(parse_answer("whatever"), ApprovalScope::Deny);
    }
}
