//! Hive - Rust 智能体执行引擎
//!
//! 模块划分：
//! - **agent**: 组装层（Harness），从配置构建全部组件
//! - **batch**: 批量编排（数据集、内容指纹、检查点、结果写入、统计）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、重试与恢复、运行监管、动作并发调度
//! - **llm**: 模型客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **memory**: 对话、token 估算、轨迹导出
//! - **observability**: 日志初始化
//! - **react**: 执行循环、上下文压缩、过程事件
//! - **safety**: 危险模式、审批白名单、审批闸门
//! - **session**: 按任务持有的执行环境（本地 / Docker）
//! - **tools**: 动作注册表、执行器与内置动作
//! - **toolsets**: 工具集图与能力集解析

pub mod agent;
pub mod batch;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod safety;
pub mod session;
pub mod tools;
pub mod toolsets;

pub use agent::Harness;
pub use config::{load_config, AppConfig};
