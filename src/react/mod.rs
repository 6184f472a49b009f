//! 执行层：单任务执行循环、上下文压缩与过程事件

pub mod compression;
pub mod events;
pub mod loop_;

pub use compression::{CompressionSettings, ContextCompressor, ElidingCompressor};
pub use events::ReactEvent;
pub use loop_::{
    ActionRecord, AgentLoop, LoopSettings, RunOutcome, RunStatus, RunTask, DEFAULT_SYSTEM_PROMPT, NO_ANSWER,
};
