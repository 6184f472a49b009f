//! 核心层：错误与恢复、重试策略、运行监管、动作并发调度

pub mod error;
pub mod recovery;
pub mod session_supervisor;
pub mod task_scheduler;

pub use error::{AgentError, ErrorKind, RecoveryAction};
pub use recovery::{RecoveryEngine, RetryPolicy};
pub use session_supervisor::RunSupervisor;
pub use task_scheduler::TaskScheduler;
