//! terminal 动作：在任务的会话环境中执行 shell 命令
//!
//! 环境由 SessionManager 按任务提供（本地或 Docker），跨调用保持工作目录，因此并发类别为 Exclusive。
//! 危险命令的拦截不在这里：审批闸门依据 command 参数做模式匹配。

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::ErrorKind;
use crate::session::SessionError;
use crate::tools::schema::{parameters_for, parse_args, TerminalArgs};
use crate::tools::{ActionContext, ActionError, Concurrency, Tool};

/// 输出超过该字符数时截断
const MAX_OUTPUT_CHARS: usize = 50_000;

pub struct TerminalTool {
    default_timeout: Duration,
}

impl TerminalTool {
    pub fn new(default_timeout_secs: u64) -> Self {
        Self {
            default_timeout: Duration::from_secs(default_timeout_secs.max(1)),
        }
    }
}

fn truncate(s: &str) -> String {
    if s.chars().count() > MAX_OUTPUT_CHARS {
        s.chars().take(MAX_OUTPUT_CHARS).collect::<String>() + "\n...[truncated]"
    } else {
        s.to_string()
    }
}

impl From<SessionError> for ActionError {
    fn from(e: SessionError) -> Self {
        let kind = match e {
            SessionError::Timeout(_) => ErrorKind::Timeout,
            SessionError::Start(_) | SessionError::Cleanup(_) => ErrorKind::Session,
            SessionError::Exec(_) => ErrorKind::ActionFailed,
        };
        ActionError::new(kind, e.to_string())
    }
}

#[async_trait]
impl Tool for TerminalTool {
    fn name(&self) -> &str {
        "terminal"
    }

    fn description(&self) -> &str {
        "Execute a shell command in this task's persistent environment. The working directory is kept between calls. Returns stdout, stderr and exit_code."
    }

    fn parameters_schema(&self) -> Value {
        parameters_for::<TerminalArgs>()
    }

    fn concurrency(&self) -> Concurrency {
        Concurrency::Exclusive
    }

    fn command_argument(&self) -> Option<&str> {
        Some("command")
    }

    async fn execute(&self, args: Value, ctx: &ActionContext) -> Result<String, ActionError> {
        let args: TerminalArgs = parse_args(args)?;
        let command = args.command.trim();
        if command.is_empty() {
            return Err(ActionError::validation("empty command"));
        }
        let timeout = args
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        tracing::info!(task_id = %ctx.task_id, command = %command, "terminal execute");
        let env = ctx.sessions.get_or_create(&ctx.task_id).await?;
        let out = env.execute(command, timeout).await?;

        Ok(json!({
            "stdout": truncate(out.stdout.trim_end()),
            "stderr": truncate(out.stderr.trim_end()),
            "exit_code": out.exit_code,
        })
        .to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::session::{EnvironmentConfig, SessionManager};

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminal_runs_in_task_session() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = Arc::new(SessionManager::new(EnvironmentConfig {
            cwd: Some(dir.path().to_path_buf()),
            ..Default::default()
        }));
        let ctx = ActionContext {
            task_id: "t1".into(),
            sessions: sessions.clone(),
        };
        let tool = TerminalTool::new(10);
        tool.execute(json!({"command": "mkdir d && cd d"}), &ctx).await.unwrap();
        let out = tool.execute(json!({"command": "basename \"$(pwd)\""}), &ctx).await.unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["stdout"], "d");
        assert_eq!(v["exit_code"], 0);
        assert_eq!(sessions.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_empty_command_is_validation_error() {
        let ctx = ActionContext {
            task_id: "t".into(),
            sessions: Arc::new(SessionManager::new(EnvironmentConfig::default())),
        };
        let err = TerminalTool::new(1)
            .execute(json!({"command": "  "}), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }
}
