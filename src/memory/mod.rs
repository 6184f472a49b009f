//! 记忆层：对话（短期）、上下文预算、轨迹导出

pub mod conversation;
pub mod token_budget;
pub mod trajectory;

pub use conversation::{Conversation, ConversationError, Message, Role, ToolCallRequest};
pub use token_budget::{ContextMonitor, TokenEstimator};
pub use trajectory::{to_trajectory, TrajectoryTurn};
