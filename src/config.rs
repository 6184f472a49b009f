//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__AGENT__MAX_TURNS=20`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::core::RetryPolicy;
use crate::react::CompressionSettings;
use crate::session::EnvironmentConfig;
use crate::toolsets::Toolset;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmSection,
    pub agent: AgentSection,
    /// [terminal] 段：执行后端（local / docker）
    pub terminal: EnvironmentConfig,
    pub approval: ApprovalSection,
    pub toolsets: ToolsetsSection,
    pub batch: BatchSection,
}

/// [llm] 段：OpenAI 兼容端点、模型、超时与重试
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// 存放 API Key 的环境变量名
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// 模型上下文长度（token）
    #[serde(default = "default_context_length")]
    pub context_length: usize,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            context_length: default_context_length(),
            timeouts: LlmTimeoutsSection::default(),
            retry: RetryPolicy::default(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_context_length() -> usize {
    128_000
}

impl LlmSection {
    /// 从 api_key_env 指定的环境变量读取 Key；本地端点可以不设置
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env).ok().filter(|k| !k.trim().is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    /// 单次请求超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    120
}

/// [agent] 段：轮数、并发、超时与上下文压缩
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    /// 同一轮中可并发执行的动作数上限
    #[serde(default = "default_max_concurrent_actions")]
    pub max_concurrent_actions: usize,
    /// 单次动作调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    /// 单任务墙钟上限（秒），不设则只受轮数限制
    pub run_timeout_secs: Option<u64>,
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub compression: CompressionSettings,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            max_concurrent_actions: default_max_concurrent_actions(),
            tool_timeout_secs: default_tool_timeout_secs(),
            run_timeout_secs: None,
            grace_period_secs: default_grace_period_secs(),
            system_prompt: None,
            compression: CompressionSettings::default(),
        }
    }
}

fn default_max_turns() -> usize {
    10
}

fn default_max_concurrent_actions() -> usize {
    3
}

fn default_tool_timeout_secs() -> u64 {
    180
}

fn default_grace_period_secs() -> u64 {
    10
}

/// 审批交互方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    /// `hive run` 在终端询问；批量模式始终非交互
    #[default]
    Interactive,
    NonInteractive,
}

/// [approval] 段：持久化白名单路径与交互方式
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ApprovalSection {
    pub allowlist_path: Option<PathBuf>,
    #[serde(default)]
    pub mode: ApprovalMode,
}

impl ApprovalSection {
    /// 未配置时用 ~/.hive/approvals.toml，取不到 HOME 则用 ./.hive/approvals.toml
    pub fn resolved_allowlist_path(&self) -> PathBuf {
        if let Some(p) = &self.allowlist_path {
            return p.clone();
        }
        let base = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        base.join(".hive").join("approvals.toml")
    }
}

/// [toolsets] 段：默认启用/禁用的名称与自定义工具集
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ToolsetsSection {
    #[serde(default)]
    pub enabled: Vec<String>,
    #[serde(default)]
    pub disabled: Vec<String>,
    /// [[toolsets.custom]]：同名时覆盖内置定义
    #[serde(default)]
    pub custom: Vec<Toolset>,
}

/// [batch] 段
#[derive(Debug, Clone, Deserialize)]
pub struct BatchSection {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for BatchSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            output_dir: default_output_dir(),
        }
    }
}

fn default_workers() -> usize {
    4
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Backend;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.agent.max_turns, 10);
        assert_eq!(cfg.llm.retry.max_attempts, 3);
        assert_eq!(cfg.llm.timeouts.request, 120);
        assert_eq!(cfg.terminal.backend, Backend::Local);
        assert_eq!(cfg.batch.workers, 4);
        assert_eq!(cfg.approval.mode, ApprovalMode::Interactive);
        assert!(cfg.agent.compression.enabled);
    }

    #[test]
    fn test_explicit_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hive.toml");
        std::fs::write(
            &path,
            r#"
[agent]
max_turns = 25

[agent.compression]
threshold = 0.5

[terminal]
backend = "docker"

[approval]
mode = "non_interactive"

[[toolsets.custom]]
name = "shell_only"
actions = ["terminal"]
"#,
        )
        .unwrap();
        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.agent.max_turns, 25);
        assert_eq!(cfg.agent.max_concurrent_actions, 3);
        assert_eq!(cfg.agent.compression.threshold, 0.5);
        assert_eq!(cfg.terminal.backend, Backend::Docker);
        assert_eq!(cfg.terminal.docker_image, "python:3.11-slim");
        assert_eq!(cfg.approval.mode, ApprovalMode::NonInteractive);
        assert_eq!(cfg.toolsets.custom[0].actions, vec!["terminal".to_string()]);
    }
}
