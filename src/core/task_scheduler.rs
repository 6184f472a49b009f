//! 任务调度：动作并发池
//!
//! 单个任务内，同一轮中互相独立的动作可以并发分发；Semaphore 限制同时执行的动作数。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::core::AgentError;

/// 动作并发调度器（每个 Execution Loop 一个）
#[derive(Debug, Clone)]
pub struct TaskScheduler {
    /// 动作并发限制（默认 3）
    action_semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl TaskScheduler {
    pub fn new(max_concurrent_actions: usize) -> Self {
        let max_concurrent = max_concurrent_actions.max(1);
        Self {
            action_semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// 获取动作执行许可
    pub async fn acquire_action(&self) -> Result<OwnedSemaphorePermit, AgentError> {
        self.action_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AgentError::Cancelled)
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(3)
    }
}
