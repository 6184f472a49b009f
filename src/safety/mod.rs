//! 安全层：危险模式表、持久化审批白名单、审批闸门与交互通道

pub mod allowlist;
pub mod gate;
pub mod prompt;
pub mod rules;

pub use allowlist::{ApprovalAllowlist, ApprovalError};
pub use gate::{
    ApprovalGate, ApprovalPrompt, ApprovalRequest, ApprovalScope, Decision, NonInteractive, RunContext,
};
pub use prompt::StdinPrompt;
pub use rules::{DangerousPattern, PatternRules, DANGEROUS_PATTERNS};
