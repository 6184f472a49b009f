//! 运行监管：取消令牌与墙钟截止时间
//!
//! 每个 Execution Loop 持有一个 RunSupervisor。每次调用模型前检查 is_expired()；
//! 动作分发进行中若到期，允许在宽限期内完成（hard_stop 在截止 + 宽限期后返回）。

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// 单次运行的生命周期：取消令牌、可选截止时间、宽限期
#[derive(Debug, Clone)]
pub struct RunSupervisor {
    cancel_token: CancellationToken,
    deadline: Option<Instant>,
    grace: Duration,
}

impl RunSupervisor {
    pub fn new(run_timeout: Option<Duration>, grace: Duration) -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            deadline: run_timeout.map(|t| Instant::now() + t),
            grace,
        }
    }

    /// 使用外部令牌（如批量编排的全局取消）的子令牌
    pub fn with_parent(parent: &CancellationToken, run_timeout: Option<Duration>, grace: Duration) -> Self {
        Self {
            cancel_token: parent.child_token(),
            ..Self::new(run_timeout, grace)
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 触发取消（用户 Ctrl+C）
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// 已取消或已过截止时间
    pub fn is_expired(&self) -> bool {
        self.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// 取消或到期时返回；无截止且未取消时永不返回
    pub async fn stopped(&self) {
        let deadline = self.deadline;
        tokio::select! {
            _ = self.cancel_token.cancelled() => {}
            _ = async {
                match deadline {
                    Some(d) => tokio::time::sleep_until(d).await,
                    None => std::future::pending::<()>().await,
                }
            } => {}
        }
    }

    /// 在 stopped 之后再等待宽限期才返回
    pub async fn hard_stop(&self) {
        self.stopped().await;
        tokio::time::sleep(self.grace).await;
    }
}

impl Default for RunSupervisor {
    fn default() -> Self {
        Self::new(None, Duration::from_secs(10))
    }
}
