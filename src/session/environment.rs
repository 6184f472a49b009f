//! 执行环境：本地 shell 与 Docker 容器
//!
//! 两种环境都在每次命令后追加 pwd 标记，从而在多次调用之间保持工作目录。
//! 本地环境共享宿主机持久状态（非隔离），Docker 环境按任务独占一个容器（隔离）。

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;

/// 执行后端
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// 直接在宿主机运行（共享持久状态）
    #[default]
    Local,
    /// 每个任务一个容器
    Docker,
}

impl Backend {
    /// 隔离后端上危险动作可自动放行
    pub fn is_isolated(&self) -> bool {
        matches!(self, Backend::Docker)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Local => "local",
            Backend::Docker => "docker",
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to start environment: {0}")]
    Start(String),
    #[error("failed to run command: {0}")]
    Exec(String),
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
    #[error("cleanup failed: {0}")]
    Cleanup(String),
}

/// 单条命令的执行结果（非零退出码不视为错误）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// 有状态执行环境：由 SessionManager 按任务创建与释放
#[async_trait]
pub trait ExecutionEnvironment: Send + Sync {
    fn backend(&self) -> Backend;

    async fn execute(&self, command: &str, timeout: Duration) -> Result<CommandOutput, SessionError>;

    /// 释放资源；失败由调用方记录日志，不影响任务结果
    async fn cleanup(&self) -> Result<(), SessionError>;
}

const CWD_MARKER: &str = "__HIVE_CWD__";

/// 包装命令：执行后输出 pwd 标记并保留原退出码
fn wrap_command(command: &str) -> String {
    format!(
        "{command}\n__hive_status=$?\nprintf '\\n{CWD_MARKER}%s\\n' \"$(pwd)\"\nexit $__hive_status"
    )
}

/// 从 stdout 中剥离 pwd 标记，返回 (真实输出, 新工作目录)
fn split_cwd_marker(stdout: &str) -> (String, Option<String>) {
    match stdout.rfind(CWD_MARKER) {
        Some(pos) => {
            let cwd = stdout[pos + CWD_MARKER.len()..].trim().to_string();
            let body = stdout[..pos].strip_suffix('\n').unwrap_or(&stdout[..pos]);
            (body.to_string(), Some(cwd).filter(|c| !c.is_empty()))
        }
        None => (stdout.to_string(), None),
    }
}

async fn run_with_timeout(mut cmd: Command, timeout: Duration) -> Result<std::process::Output, SessionError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let child = cmd.spawn().map_err(|e| SessionError::Exec(e.to_string()))?;
    tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| SessionError::Timeout(timeout))?
        .map_err(|e| SessionError::Exec(e.to_string()))
}

/// 本地 shell 环境（sh -c），跨调用保持 cwd
pub struct LocalEnvironment {
    cwd: Mutex<PathBuf>,
}

impl LocalEnvironment {
    pub fn new(cwd: PathBuf) -> Self {
        Self { cwd: Mutex::new(cwd) }
    }

    pub async fn cwd(&self) -> PathBuf {
        self.cwd.lock().await.clone()
    }
}

#[async_trait]
impl ExecutionEnvironment for LocalEnvironment {
    fn backend(&self) -> Backend {
        Backend::Local
    }

    async fn execute(&self, command: &str, timeout: Duration) -> Result<CommandOutput, SessionError> {
        let mut cwd = self.cwd.lock().await;
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(wrap_command(command)).current_dir(&*cwd);
        let output = run_with_timeout(cmd, timeout).await?;

        let raw = String::from_utf8_lossy(&output.stdout);
        let (stdout, new_cwd) = split_cwd_marker(&raw);
        if let Some(dir) = new_cwd {
            *cwd = PathBuf::from(dir);
        }
        Ok(CommandOutput {
            stdout,
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn cleanup(&self) -> Result<(), SessionError> {
        Ok(())
    }
}

/// Docker 环境：首次执行时 `docker run -d` 启动容器，之后 `docker exec`，释放时 `docker rm -f`
pub struct DockerEnvironment {
    image: String,
    task_id: String,
    container: Mutex<Option<String>>,
    cwd: Mutex<String>,
}

impl DockerEnvironment {
    pub fn new(image: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            task_id: task_id.into(),
            container: Mutex::new(None),
            cwd: Mutex::new("/".to_string()),
        }
    }

    async fn ensure_container(&self) -> Result<String, SessionError> {
        let mut guard = self.container.lock().await;
        if let Some(id) = guard.as_ref() {
            return Ok(id.clone());
        }
        let name = format!("hive-{}", sanitize(&self.task_id));
        let mut cmd = Command::new("docker");
        cmd.args(["run", "-d", "--name", &name, &self.image, "sleep", "infinity"]);
        let output = run_with_timeout(cmd, Duration::from_secs(120))
            .await
            .map_err(|e| SessionError::Start(e.to_string()))?;
        if !output.status.success() {
            return Err(SessionError::Start(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        tracing::info!(task_id = %self.task_id, container = %id, image = %self.image, "docker environment started");
        *guard = Some(id.clone());
        Ok(id)
    }
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .take(48)
        .collect()
}

#[async_trait]
impl ExecutionEnvironment for DockerEnvironment {
    fn backend(&self) -> Backend {
        Backend::Docker
    }

    async fn execute(&self, command: &str, timeout: Duration) -> Result<CommandOutput, SessionError> {
        let id = self.ensure_container().await?;
        let mut cwd = self.cwd.lock().await;
        let wrapped = wrap_command(command);
        let mut cmd = Command::new("docker");
        cmd.args(["exec", "-w", cwd.as_str(), &id, "sh", "-c", &wrapped]);
        let output = run_with_timeout(cmd, timeout).await?;

        let raw = String::from_utf8_lossy(&output.stdout);
        let (stdout, new_cwd) = split_cwd_marker(&raw);
        if let Some(dir) = new_cwd {
            *cwd = dir;
        }
        Ok(CommandOutput {
            stdout,
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn cleanup(&self) -> Result<(), SessionError> {
        let Some(id) = self.container.lock().await.take() else {
            return Ok(());
        };
        let mut cmd = Command::new("docker");
        cmd.args(["rm", "-f", &id]);
        let output = run_with_timeout(cmd, Duration::from_secs(60))
            .await
            .map_err(|e| SessionError::Cleanup(e.to_string()))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(SessionError::Cleanup(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_cwd_marker() {
        let (body, cwd) = split_cwd_marker("hello\n\n__HIVE_CWD__/tmp\n");
        assert_eq!(body, "hello\n");
        assert_eq!(cwd.as_deref(), Some("/tmp"));

        let (body, cwd) = split_cwd_marker("no marker");
        assert_eq!(body, "no marker");
        assert!(cwd.is_none());
    }

    #[test]
    fn test_backend_isolation() {
        assert!(!Backend::Local.is_isolated());
        assert!(Backend::Docker.is_isolated());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_keeps_cwd_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();

        let env = LocalEnvironment::new(dir.path().to_path_buf());
        let out = env.execute("cd sub && echo moved", Duration::from_secs(10)).await.unwrap();
        assert_eq!(out.stdout.trim(), "moved");
        assert_eq!(out.exit_code, 0);
        assert_eq!(env.cwd().await.canonicalize().unwrap(), sub.canonicalize().unwrap());

        let out = env.execute("exit 3", Duration::from_secs(10)).await.unwrap();
        assert_eq!(out.exit_code, 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_timeout() {
        let env = LocalEnvironment::new(std::env::temp_dir());
        let err = env.execute("sleep 5", Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, SessionError::Timeout(_)));
    }
}
