//! 会话层：每个任务独占的有状态执行环境（本地 / Docker）

pub mod environment;
pub mod manager;

pub use environment::{
    Backend, CommandOutput, DockerEnvironment, ExecutionEnvironment, LocalEnvironment, SessionError,
};
pub use manager::{EnvironmentConfig, SessionManager};
