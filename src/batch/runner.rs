//! 批量编排
//!
//! 固定数量的 worker 从共享队列取任务：指纹在检查点中则跳过，与本批已认领的任务内容相同则去重，
//! 否则在独立的 tokio 任务中执行（panic 只影响该任务），结果交给单写者写入器。
//! 只有编排级错误（数据集不可读、输出不可写）会中止整个批次。

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::batch::{
    load_checkpoint, load_dataset, BatchError, BatchStats, OutputRecord, ResultSink, SinkSender,
    StatisticsReport, TaskRecord, TaskStatus,
};
use crate::core::ErrorKind;
use crate::react::{RunOutcome, RunTask};

pub const OUTPUT_FILE: &str = "trajectories.jsonl";
pub const CHECKPOINT_FILE: &str = "checkpoint.jsonl";
pub const STATISTICS_FILE: &str = "statistics.json";

/// 交给执行循环的一个任务
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub task: RunTask,
    pub enabled: Vec<String>,
    pub disabled: Vec<String>,
    pub max_turns: usize,
}

/// 单任务执行接口；Harness 用真实模型实现，测试中可替换
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run_task(&self, request: TaskRequest) -> RunOutcome;

    /// 写入统计与输出元数据的模型名
    fn model_name(&self) -> String {
        "unknown".to_string()
    }
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub run_name: String,
    /// 输出根目录；本次运行的文件位于 <output_dir>/<run_name>/
    pub output_dir: PathBuf,
    pub workers: usize,
    pub resume: bool,
    pub toolsets: Vec<String>,
    pub disabled_toolsets: Vec<String>,
    pub max_turns: usize,
    pub ephemeral: Option<String>,
}

impl BatchOptions {
    pub fn new(run_name: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_name: run_name.into(),
            output_dir: output_dir.into(),
            workers: 4,
            resume: false,
            toolsets: Vec::new(),
            disabled_toolsets: Vec::new(),
            max_turns: 10,
            ephemeral: None,
        }
    }

    pub fn run_dir(&self) -> PathBuf {
        self.output_dir.join(&self.run_name)
    }
}

struct Shared {
    runner: Arc<dyn TaskRunner>,
    options: BatchOptions,
    model: String,
    queue: Mutex<VecDeque<TaskRecord>>,
    /// 检查点中已完成的指纹（启动时读取，运行中只读）
    finalized: HashSet<String>,
    /// 本批已认领的指纹
    claimed: Mutex<HashSet<String>>,
    sink: SinkSender,
    stats: Arc<BatchStats>,
    cancel: CancellationToken,
    total: usize,
}

pub struct BatchRunner {
    runner: Arc<dyn TaskRunner>,
    options: BatchOptions,
    shutdown: CancellationToken,
}

fn panic_message(err: tokio::task::JoinError) -> String {
    if !err.is_panic() {
        return "task was cancelled".to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("task panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("task panicked: {s}")
    } else {
        "task panicked".to_string()
    }
}

impl BatchRunner {
    pub fn new(runner: Arc<dyn TaskRunner>, options: BatchOptions) -> Self {
        Self {
            runner,
            options,
            shutdown: CancellationToken::new(),
        }
    }

    /// 外部取消（Ctrl+C）：worker 不再领取新任务。
    /// 执行中的任务应使用同一令牌，被取消的运行记为 Failed(Cancelled)，不进入检查点
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn options(&self) -> &BatchOptions {
        &self.options
    }

    pub fn output_path(&self) -> PathBuf {
        self.options.run_dir().join(OUTPUT_FILE)
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.options.run_dir().join(CHECKPOINT_FILE)
    }

    pub fn statistics_path(&self) -> PathBuf {
        self.options.run_dir().join(STATISTICS_FILE)
    }

    pub async fn run(&self, dataset: &Path) -> Result<StatisticsReport, BatchError> {
        let records = load_dataset(dataset).await?;
        self.run_records(records).await
    }

    pub async fn run_records(&self, records: Vec<TaskRecord>) -> Result<StatisticsReport, BatchError> {
        let started = Instant::now();
        let run_dir = self.options.run_dir();
        tokio::fs::create_dir_all(&run_dir)
            .await
            .map_err(|source| BatchError::Write {
                path: run_dir.clone(),
                source,
            })?;

        let finalized = if self.options.resume {
            load_checkpoint(&self.checkpoint_path()).await?
        } else {
            HashSet::new()
        };
        if !finalized.is_empty() {
            tracing::info!(finalized = finalized.len(), "resuming from checkpoint");
        }

        let sink = ResultSink::open(&self.output_path(), &self.checkpoint_path(), self.options.resume).await?;
        let stats = Arc::new(BatchStats::new());
        let total = records.len();
        let workers = self.options.workers.max(1);
        let shared = Arc::new(Shared {
            runner: self.runner.clone(),
            options: self.options.clone(),
            model: self.runner.model_name(),
            queue: Mutex::new(records.into()),
            finalized,
            claimed: Mutex::new(HashSet::new()),
            sink: sink.sender(),
            stats: stats.clone(),
            cancel: self.shutdown.child_token(),
            total,
        });

        tracing::info!(run = %self.options.run_name, total, workers, "batch started");
        let mut set = JoinSet::new();
        for worker_id in 0..workers {
            set.spawn(worker(shared.clone(), worker_id));
        }

        let mut fatal: Option<BatchError> = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "batch aborted");
                    shared.cancel.cancel();
                    fatal.get_or_insert(e);
                }
                Err(e) => tracing::error!(error = %e, "worker task failed"),
            }
        }
        let model = shared.model.clone();
        drop(shared);
        sink.close().await;
        if let Some(e) = fatal {
            return Err(e);
        }

        let report = stats.report(&self.options.run_name, &model, total, started.elapsed().as_secs_f64());
        let path = self.statistics_path();
        tokio::fs::write(&path, serde_json::to_string_pretty(&report)?)
            .await
            .map_err(|source| BatchError::Write { path, source })?;
        tracing::info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            duplicates = report.duplicates,
            "batch finished"
        );
        Ok(report)
    }
}

async fn worker(shared: Arc<Shared>, worker_id: usize) -> Result<(), BatchError> {
    loop {
        if shared.cancel.is_cancelled() {
            tracing::info!(worker_id, "worker stopping: batch cancelled");
            break;
        }
        let next = shared.queue.lock().await.pop_front();
        let Some(mut record) = next else { break };

        if shared.finalized.contains(&record.fingerprint) {
            tracing::debug!(index = record.index, "skipping task already in checkpoint");
            shared.stats.record_skipped();
            continue;
        }
        if !shared.claimed.lock().await.insert(record.fingerprint.clone()) {
            tracing::info!(index = record.index, "skipping duplicate task content");
            shared.stats.record_duplicate();
            continue;
        }

        record.status = TaskStatus::Running;
        let task_id = record.task_id();
        let options = &shared.options;
        let enabled = record.toolsets.clone().unwrap_or_else(|| options.toolsets.clone());
        let request = TaskRequest {
            task: RunTask::new(&task_id, &record.prompt).with_ephemeral(options.ephemeral.clone()),
            enabled: enabled.clone(),
            disabled: options.disabled_toolsets.clone(),
            max_turns: options.max_turns,
        };
        tracing::info!(worker_id, task_id = %task_id, "task started");

        let runner = shared.runner.clone();
        let outcome = match tokio::spawn(async move { runner.run_task(request).await }).await {
            Ok(o) => o,
            Err(e) => {
                let msg = panic_message(e);
                tracing::error!(task_id = %task_id, error = %msg, "task aborted");
                RunOutcome::aborted(&task_id, ErrorKind::Panic, msg)
            }
        };
        shared.stats.record_outcome(&outcome);
        record.status = if outcome.succeeded() {
            TaskStatus::Done
        } else {
            TaskStatus::Failed
        };

        let output = OutputRecord {
            task_id: task_id.clone(),
            prompt_index: record.index,
            fingerprint: record.fingerprint.clone(),
            status: record.status,
            completed: outcome.completed(),
            final_response: outcome.final_response.clone(),
            api_calls: outcome.api_calls,
            turns: outcome.turns,
            toolsets_used: enabled,
            error: outcome.error.clone(),
            error_kind: outcome.error_kind(),
            conversations: outcome.trajectory(),
            metadata: serde_json::json!({
                "run_name": options.run_name,
                "model": shared.model,
                "worker": worker_id,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }),
        };
        shared.sink.write(output).await?;

        let finished = shared.stats.attempted();
        tracing::info!(
            task_id = %task_id,
            status = ?record.status,
            progress = %format!("{finished}/{}", shared.total),
            "task finished"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::batch::{parse_checkpoint, parse_dataset};
    use crate::react::{RunStatus, NO_ANSWER};

    /// prompt 为 "boom" 时 panic，其余直接完成
    struct Flaky {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl TaskRunner for Flaky {
        async fn run_task(&self, request: TaskRequest) -> RunOutcome {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if request.task.prompt == "boom" {
                panic!("handler exploded");
            }
            RunOutcome {
                task_id: request.task.task_id.clone(),
                status: RunStatus::Completed,
                final_response: format!("done: {}", request.task.prompt),
                messages: vec![],
                turns: 1,
                api_calls: 1,
                actions: vec![],
                error: None,
            }
        }
    }

    #[tokio::test]
    async fn test_panic_isolated_to_its_task() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(Flaky { runs: AtomicUsize::new(0) });
        let mut options = BatchOptions::new("panic", dir.path());
        options.workers = 2;
        let batch = BatchRunner::new(runner.clone(), options);
        let records = parse_dataset("{\"prompt\":\"a\"}\n{\"prompt\":\"boom\"}\n{\"prompt\":\"c\"}\n");
        let report = batch.run_records(records).await.unwrap();

        assert_eq!(runner.runs.load(Ordering::SeqCst), 3);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed_by_kind.get(&ErrorKind::Panic), Some(&1));
        let output = std::fs::read_to_string(batch.output_path()).unwrap();
        let failed: Vec<serde_json::Value> = output
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .filter(|v: &serde_json::Value| v["status"] == "failed")
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0]["final_response"], NO_ANSWER);
        assert!(failed[0]["error"].as_str().unwrap().contains("handler exploded"));
        assert!(batch.statistics_path().exists());
    }

    /// prompt 为 "stop" 时触发关闭令牌，并像执行循环一样报告 Cancelled
    struct Interrupted {
        token: CancellationToken,
        runs: AtomicUsize,
    }

    #[async_trait]
    impl TaskRunner for Interrupted {
        async fn run_task(&self, request: TaskRequest) -> RunOutcome {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if request.task.prompt == "stop" {
                self.token.cancel();
                return RunOutcome::aborted(&request.task.task_id, ErrorKind::Cancelled, "Run cancelled");
            }
            RunOutcome {
                task_id: request.task.task_id.clone(),
                status: RunStatus::Completed,
                final_response: "ok".into(),
                messages: vec![],
                turns: 1,
                api_calls: 1,
                actions: vec![],
                error: None,
            }
        }
    }

    #[tokio::test]
    async fn test_cancel_mid_batch_keeps_unrun_tasks_out_of_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        let runner = Arc::new(Interrupted {
            token: token.clone(),
            runs: AtomicUsize::new(0),
        });
        let mut options = BatchOptions::new("cancel", dir.path());
        options.workers = 1;
        let batch = BatchRunner::new(runner.clone(), options).with_shutdown(token);
        let records = parse_dataset("{\"prompt\":\"a\"}\n{\"prompt\":\"stop\"}\n{\"prompt\":\"c\"}\n");
        let fingerprints: Vec<String> = records.iter().map(|r| r.fingerprint.clone()).collect();
        let report = batch.run_records(records).await.unwrap();

        assert_eq!(runner.runs.load(Ordering::SeqCst), 2);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed_by_kind.get(&ErrorKind::Cancelled), Some(&1));
        let done = parse_checkpoint(&std::fs::read_to_string(batch.checkpoint_path()).unwrap());
        assert!(done.contains(&fingerprints[0]));
        assert!(!done.contains(&fingerprints[1]));
        assert!(!done.contains(&fingerprints[2]));
    }

    #[tokio::test]
    async fn test_unwritable_output_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let runner = Arc::new(Flaky { runs: AtomicUsize::new(0) });
        let batch = BatchRunner::new(runner, BatchOptions::new("run", &blocker));
        let err = batch.run_records(parse_dataset("{\"prompt\":\"a\"}")).await.unwrap_err();
        assert!(matches!(err, BatchError::Write { .. }));
    }
}
