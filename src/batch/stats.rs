//! 批量统计：各 worker 并发累加，计数器可交换，无需全局顺序

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

use crate::core::ErrorKind;
use crate::react::{ActionRecord, RunOutcome};

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ActionStats {
    pub count: u64,
    pub success: u64,
    pub failure: u64,
    pub success_rate: f64,
    pub failure_rate: f64,
}

#[derive(Debug, Default)]
pub struct BatchStats {
    attempted: AtomicU64,
    succeeded: AtomicU64,
    /// 成功任务中模型给出了最终回答的数量
    completed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    duplicates: AtomicU64,
    failed_by_kind: Mutex<BTreeMap<ErrorKind, u64>>,
    actions: Mutex<BTreeMap<String, ActionStats>>,
}

/// 写入 statistics.json 的快照
#[derive(Debug, Clone, Serialize)]
pub struct StatisticsReport {
    pub run_name: String,
    pub model: String,
    pub total_records: usize,
    pub attempted: u64,
    pub succeeded: u64,
    pub completed: u64,
    pub failed: u64,
    /// 检查点中已完成、本次跳过的任务
    pub skipped: u64,
    /// 与同批其他行内容相同而未执行的任务
    pub duplicates: u64,
    pub failed_by_kind: BTreeMap<ErrorKind, u64>,
    pub tool_statistics: BTreeMap<String, ActionStats>,
    pub completed_at: String,
    pub duration_seconds: f64,
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

impl BatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_outcome(&self, outcome: &RunOutcome) {
        self.attempted.fetch_add(1, Ordering::Relaxed);
        match outcome.error_kind() {
            None => {
                self.succeeded.fetch_add(1, Ordering::Relaxed);
                if outcome.completed() {
                    self.completed.fetch_add(1, Ordering::Relaxed);
                }
            }
            Some(kind) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                let mut by_kind = self.failed_by_kind.lock().unwrap_or_else(|e| e.into_inner());
                *by_kind.entry(kind).or_default() += 1;
            }
        }
        self.record_actions(&outcome.actions);
    }

    fn record_actions(&self, actions: &[ActionRecord]) {
        if actions.is_empty() {
            return;
        }
        let mut table = self.actions.lock().unwrap_or_else(|e| e.into_inner());
        for a in actions {
            let entry = table.entry(a.tool.clone()).or_default();
            entry.count += 1;
            if a.ok {
                entry.success += 1;
            } else {
                entry.failure += 1;
            }
        }
    }

    pub fn attempted(&self) -> u64 {
        self.attempted.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn report(&self, run_name: &str, model: &str, total_records: usize, duration_seconds: f64) -> StatisticsReport {
        let failed_by_kind = self.failed_by_kind.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let mut tool_statistics = self.actions.lock().unwrap_or_else(|e| e.into_inner()).clone();
        for s in tool_statistics.values_mut() {
            let total = s.success + s.failure;
            if total > 0 {
                s.success_rate = round2(s.success as f64 / total as f64 * 100.0);
                s.failure_rate = round2(s.failure as f64 / total as f64 * 100.0);
            }
        }
        StatisticsReport {
            run_name: run_name.to_string(),
            model: model.to_string(),
            total_records,
            attempted: self.attempted(),
            succeeded: self.succeeded(),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed(),
            skipped: self.skipped.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            failed_by_kind,
            tool_statistics,
            completed_at: chrono::Utc::now().to_rfc3339(),
            duration_seconds: round2(duration_seconds),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::react::{RunStatus, NO_ANSWER};

    fn outcome(status: RunStatus, actions: Vec<(&str, bool)>) -> RunOutcome {
        RunOutcome {
            task_id: "t".into(),
            status,
            final_response: NO_ANSWER.into(),
            messages: vec![],
            turns: 1,
            api_calls: 1,
            actions: actions
                .into_iter()
                .map(|(tool, ok)| ActionRecord {
                    call_id: "c".into(),
                    tool: tool.into(),
                    ok,
                    error_kind: if ok { None } else { Some(ErrorKind::ActionFailed) },
                    duration_ms: 1,
                })
                .collect(),
            error: None,
        }
    }

    #[tokio::test]
    async fn test_concurrent_updates_add_up() {
        let stats = Arc::new(BatchStats::new());
        let mut handles = Vec::new();
        for i in 0..20 {
            let stats = stats.clone();
            handles.push(tokio::spawn(async move {
                let status = if i % 4 == 0 {
                    RunStatus::Failed(ErrorKind::Transport)
                } else {
                    RunStatus::Completed
                };
                stats.record_outcome(&outcome(status, vec![("terminal", true), ("web_extract", i % 2 == 0)]));
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let report = stats.report("run", "mock", 20, 1.234);
        assert_eq!(report.attempted, 20);
        assert_eq!(report.succeeded, 15);
        assert_eq!(report.failed, 5);
        assert_eq!(report.failed_by_kind.get(&ErrorKind::Transport), Some(&5));
        let web = &report.tool_statistics["web_extract"];
        assert_eq!((web.count, web.success, web.failure), (20, 10, 10));
        assert_eq!(web.success_rate, 50.0);
        assert_eq!(report.tool_statistics["terminal"].success_rate, 100.0);
        assert_eq!(report.duration_seconds, 1.23);
    }

    #[test]
    fn test_turn_limit_counts_as_success_not_completed() {
        let stats = BatchStats::new();
        stats.record_outcome(&outcome(RunStatus::TurnLimitReached, vec![]));
        let report = stats.report("r", "m", 1, 0.0);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.completed, 0);
    }
}
