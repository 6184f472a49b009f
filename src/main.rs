//! Hive 命令行
//!
//! - `hive run <prompt>`：单任务，过程事件输出到 stderr，最终回答输出到 stdout
//! - `hive batch --dataset <jsonl> --run-name <name>`：批量执行，支持 --resume
//! - `hive toolsets`：列出工具集及其可用性
//!
//! 单个任务失败不影响退出码；只有编排级错误（配置、数据集、输出目录）返回非零。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use hive::batch::{BatchOptions, BatchRunner};
use hive::config::{load_config, ApprovalMode};
use hive::react::{ReactEvent, RunStatus, RunTask};
use hive::safety::{ApprovalPrompt, NonInteractive, StdinPrompt};
use hive::Harness;

#[derive(Parser)]
#[command(name = "hive", version, about = "Tool-calling agent harness with approval gate and resumable batch runs")]
struct Cli {
    /// 额外配置文件（覆盖 config/default.toml）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Clone)]
struct ToolsetArgs {
    /// 启用的工具集或动作名（逗号分隔；空或 all 表示全部）
    #[arg(long, value_delimiter = ',')]
    toolsets: Vec<String>,
    /// 禁用的工具集或动作名，优先于启用
    #[arg(long, value_delimiter = ',')]
    disable: Vec<String>,
    #[arg(long)]
    max_turns: Option<usize>,
    /// 执行时生效、不写入导出轨迹的临时指令
    #[arg(long)]
    ephemeral: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Run a single task
    Run {
        prompt: String,
        #[command(flatten)]
        toolsets: ToolsetArgs,
        /// 不在终端询问审批，危险动作一律拒绝
        #[arg(long)]
        non_interactive: bool,
        /// 过程事件以 JSON 行输出
        #[arg(long)]
        json_events: bool,
    },
    /// Run every record of a JSONL dataset
    Batch {
        #[arg(long)]
        dataset: PathBuf,
        #[arg(long)]
        run_name: String,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// 追加到已有输出并跳过检查点中已完成的任务
        #[arg(long)]
        resume: bool,
        #[command(flatten)]
        toolsets: ToolsetArgs,
    },
    /// List toolsets, their actions and availability
    Toolsets,
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let t = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping");
            t.cancel();
        }
    });
    token
}

fn print_event(ev: &ReactEvent, json: bool) {
    if json {
        if let Ok(line) = serde_json::to_string(ev) {
            eprintln!("{line}");
        }
        return;
    }
    match ev {
        ReactEvent::StepUpdate { step, max_steps } => eprintln!("── turn {step}/{max_steps}"),
        ReactEvent::ThinkingContent { text } => eprintln!("💭 {text}"),
        ReactEvent::ToolCall { tool, args } => eprintln!("🔧 {tool} {args}"),
        ReactEvent::Observation { tool, preview } => eprintln!("   {tool} → {preview}"),
        ReactEvent::ToolFailure { tool, reason } => eprintln!("   {tool} ✗ {reason}"),
        ReactEvent::ApprovalDenied { tool, reason } => eprintln!("   {tool} ⛔ {reason}"),
        ReactEvent::Recovery { action, detail } => eprintln!("↻ {action}: {detail}"),
        ReactEvent::Compression { before_tokens, after_tokens, elided } => {
            eprintln!("⇣ context {before_tokens} → {after_tokens} tokens ({elided} results elided)")
        }
        ReactEvent::TokenUsage { total_tokens, .. } => eprintln!("tokens: {total_tokens}"),
        ReactEvent::Error { text } => eprintln!("error: {text}"),
        ReactEvent::Thinking | ReactEvent::Final { .. } => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();
    let cli = Cli::parse();
    let cfg = load_config(cli.config.clone()).context("Failed to load configuration")?;

    match cli.command {
        Command::Run {
            prompt,
            toolsets,
            non_interactive,
            json_events,
        } => {
            let channel: Arc<dyn ApprovalPrompt> =
                if non_interactive || cfg.approval.mode == ApprovalMode::NonInteractive {
                    Arc::new(NonInteractive)
                } else {
                    Arc::new(StdinPrompt::new())
                };
            let (tx, mut rx) = mpsc::unbounded_channel();
            let harness = Harness::from_config(&cfg, channel)
                .context("Failed to build harness")?
                .with_event_tx(tx)
                .with_shutdown(shutdown_on_ctrl_c());
            let printer = tokio::spawn(async move {
                while let Some(ev) = rx.recv().await {
                    print_event(&ev, json_events);
                }
            });

            let task = RunTask::new(format!("run_{}", uuid::Uuid::new_v4()), prompt)
                .with_ephemeral(toolsets.ephemeral.clone());
            let max_turns = toolsets.max_turns.unwrap_or(harness.max_turns());
            let outcome = harness
                .run(&task, &toolsets.toolsets, &toolsets.disable, max_turns)
                .await;
            drop(harness);
            let _ = printer.await;

            println!("{}", outcome.final_response);
            match outcome.status {
                RunStatus::Completed => {}
                RunStatus::TurnLimitReached => eprintln!("⚠️  stopped at turn limit ({} turns)", outcome.turns),
                RunStatus::Failed(kind) => eprintln!(
                    "❌ run failed ({kind}): {}",
                    outcome.error.as_deref().unwrap_or("unknown error")
                ),
            }
        }
        Command::Batch {
            dataset,
            run_name,
            workers,
            output_dir,
            resume,
            toolsets,
        } => {
            let shutdown = shutdown_on_ctrl_c();
            let harness = Harness::non_interactive(&cfg)
                .context("Failed to build harness")?
                .with_shutdown(shutdown.clone());
            let mut options = BatchOptions::new(run_name, output_dir.unwrap_or_else(|| cfg.batch.output_dir.clone()));
            options.workers = workers.unwrap_or(cfg.batch.workers);
            options.resume = resume;
            options.toolsets = toolsets.toolsets;
            options.disabled_toolsets = toolsets.disable;
            options.max_turns = toolsets.max_turns.unwrap_or(harness.max_turns());
            options.ephemeral = toolsets.ephemeral;

            let runner = BatchRunner::new(Arc::new(harness), options).with_shutdown(shutdown);
            let report = runner
                .run(&dataset)
                .await
                .with_context(|| format!("Batch run over {} failed", dataset.display()))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            eprintln!("output: {}", runner.output_path().display());
        }
        Command::Toolsets => {
            let harness = Harness::non_interactive(&cfg).context("Failed to build harness")?;
            for info in harness.describe_toolsets() {
                println!("{:<12} {}", info.name, info.description);
                for action in &info.actions {
                    match info.unavailable.iter().find(|(a, _)| a == action) {
                        Some((_, missing)) => println!("    - {action} (unavailable: missing {})", missing.join(", ")),
                        None => println!("    - {action}"),
                    }
                }
            }
        }
    }
    Ok(())
}
