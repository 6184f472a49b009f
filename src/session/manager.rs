//! 会话管理：按任务 ID 持有有状态执行环境
//!
//! 环境在任务首次使用有状态动作时创建，从不在任务之间共享；
//! 执行循环退出时（无论成功失败）调用 release，清理失败只记 warn。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::Mutex;

use crate::session::{Backend, DockerEnvironment, ExecutionEnvironment, LocalEnvironment, SessionError};

/// 执行环境配置（对应配置 [terminal]）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    pub backend: Backend,
    /// 本地后端的初始工作目录，缺省为进程当前目录
    pub cwd: Option<PathBuf>,
    pub docker_image: String,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Local,
            cwd: None,
            docker_image: "python:3.11-slim".to_string(),
        }
    }
}

/// 会话管理器：task_id -> 执行环境
pub struct SessionManager {
    config: EnvironmentConfig,
    sessions: Mutex<HashMap<String, Arc<dyn ExecutionEnvironment>>>,
}

impl SessionManager {
    pub fn new(config: EnvironmentConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> Backend {
        self.config.backend
    }

    /// 获取任务的环境，不存在则创建
    pub async fn get_or_create(&self, task_id: &str) -> Result<Arc<dyn ExecutionEnvironment>, SessionError> {
        let mut sessions = self.sessions.lock().await;
        if let Some(env) = sessions.get(task_id) {
            return Ok(env.clone());
        }
        let env: Arc<dyn ExecutionEnvironment> = match self.config.backend {
            Backend::Local => {
                let cwd = match &self.config.cwd {
                    Some(dir) => dir.clone(),
                    None => std::env::current_dir().map_err(|e| SessionError::Start(e.to_string()))?,
                };
                Arc::new(LocalEnvironment::new(cwd))
            }
            Backend::Docker => Arc::new(DockerEnvironment::new(&self.config.docker_image, task_id)),
        };
        tracing::debug!(task_id = %task_id, backend = self.config.backend.as_str(), "session created");
        sessions.insert(task_id.to_string(), env.clone());
        Ok(env)
    }

    /// 释放任务环境（尽力而为，失败仅记录日志）
    pub async fn release(&self, task_id: &str) {
        let env = self.sessions.lock().await.remove(task_id);
        if let Some(env) = env {
            match env.cleanup().await {
                Ok(()) => tracing::debug!(task_id = %task_id, "session released"),
                Err(e) => tracing::warn!(task_id = %task_id, error = %e, "session cleanup failed"),
            }
        }
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}
