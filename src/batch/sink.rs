//! 结果写入器：单写者 actor
//!
//! 所有 worker 通过 channel 提交结果，actor 串行写入：先写输出行并 fsync，
//! 成功后才追加检查点行并 fsync。任一步失败都通过 ack 返回给提交者。

use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::batch::{BatchError, CheckpointEntry, TaskStatus};
use crate::core::ErrorKind;
use crate::memory::TrajectoryTurn;

/// 合并输出中的一条记录（trajectories.jsonl 的一行）
///
/// 续跑会重试失败或被取消的任务，同一 fingerprint 因此可能出现多行；
/// 读取方按 fingerprint 取文件中最后一行为准，检查点中的任务只有一条 done 行。
#[derive(Debug, Clone, Serialize)]
pub struct OutputRecord {
    pub task_id: String,
    pub prompt_index: usize,
    pub fingerprint: String,
    pub status: TaskStatus,
    /// 模型给出了最终回答（到达轮数上限时为 false）
    pub completed: bool,
    pub final_response: String,
    pub api_calls: u32,
    pub turns: usize,
    pub toolsets_used: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub conversations: Vec<TrajectoryTurn>,
    pub metadata: serde_json::Value,
}

struct WriteCommand {
    record: OutputRecord,
    ack: oneshot::Sender<Result<(), BatchError>>,
}

/// 结果写入器句柄（可在 worker 间克隆共享发送端）
pub struct ResultSink {
    tx: mpsc::Sender<WriteCommand>,
    handle: JoinHandle<()>,
}

async fn open(path: &Path, resume: bool) -> Result<File, BatchError> {
    let mut opts = OpenOptions::new();
    opts.create(true);
    if resume {
        opts.append(true);
    } else {
        opts.write(true).truncate(true);
    }
    opts.open(path).await.map_err(|source| BatchError::Write {
        path: path.to_path_buf(),
        source,
    })
}

async fn append_line(file: &mut File, path: &Path, line: &str) -> Result<(), BatchError> {
    let write = async {
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        file.sync_data().await
    };
    write.await.map_err(|source| BatchError::Write {
        path: path.to_path_buf(),
        source,
    })
}

struct Writer {
    output: File,
    output_path: PathBuf,
    checkpoint: File,
    checkpoint_path: PathBuf,
}

impl Writer {
    async fn persist(&mut self, record: &OutputRecord) -> Result<(), BatchError> {
        let line = serde_json::to_string(record)?;
        append_line(&mut self.output, &self.output_path, &line).await?;
        if record.status == TaskStatus::Done {
            let entry = CheckpointEntry::new(&record.fingerprint, &record.task_id);
            let line = serde_json::to_string(&entry)?;
            append_line(&mut self.checkpoint, &self.checkpoint_path, &line).await?;
        }
        Ok(())
    }
}

impl ResultSink {
    /// 打开输出与检查点文件；resume 为 false 时两者都被清空
    pub async fn open(output_path: &Path, checkpoint_path: &Path, resume: bool) -> Result<Self, BatchError> {
        let mut writer = Writer {
            output: open(output_path, resume).await?,
            output_path: output_path.to_path_buf(),
            checkpoint: open(checkpoint_path, resume).await?,
            checkpoint_path: checkpoint_path.to_path_buf(),
        };
        let (tx, mut rx) = mpsc::channel::<WriteCommand>(64);
        let handle = tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                let result = writer.persist(&cmd.record).await;
                if let Err(e) = &result {
                    tracing::error!(task_id = %cmd.record.task_id, error = %e, "failed to persist result");
                }
                let _ = cmd.ack.send(result);
            }
        });
        Ok(Self { tx, handle })
    }

    pub fn sender(&self) -> SinkSender {
        SinkSender { tx: self.tx.clone() }
    }

    /// 关闭发送端并等待所有已提交结果写完
    pub async fn close(self) {
        drop(self.tx);
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "result writer task failed");
        }
    }
}

/// worker 持有的提交端
#[derive(Clone)]
pub struct SinkSender {
    tx: mpsc::Sender<WriteCommand>,
}

impl SinkSender {
    /// 提交并等待持久化完成
    pub async fn write(&self, record: OutputRecord) -> Result<(), BatchError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(WriteCommand { record, ack })
            .await
            .map_err(|_| BatchError::SinkClosed)?;
        done.await.map_err(|_| BatchError::SinkClosed)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::parse_checkpoint;

    fn record(fp: &str, status: TaskStatus) -> OutputRecord {
        OutputRecord {
            task_id: format!("task_{fp}"),
            prompt_index: 0,
            fingerprint: fp.to_string(),
            status,
            completed: status == TaskStatus::Done,
            final_response: "x".into(),
            api_calls: 1,
            turns: 1,
            toolsets_used: vec![],
            error: None,
            error_kind: None,
            conversations: vec![],
            metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn test_only_done_records_reach_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.jsonl");
        let ckpt = dir.path().join("ckpt.jsonl");
        let sink = ResultSink::open(&out, &ckpt, false).await.unwrap();
        let tx = sink.sender();
        tx.write(record("aa", TaskStatus::Done)).await.unwrap();
        tx.write(record("bb", TaskStatus::Failed)).await.unwrap();
        drop(tx);
        sink.close().await;

        assert_eq!(std::fs::read_to_string(&out).unwrap().lines().count(), 2);
        let done = parse_checkpoint(&std::fs::read_to_string(&ckpt).unwrap());
        assert_eq!(done.len(), 1);
        assert!(done.contains("aa"));
    }

    #[tokio::test]
    async fn test_resume_appends_fresh_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.jsonl");
        let ckpt = dir.path().join("ckpt.jsonl");
        for resume in [false, true] {
            let sink = ResultSink::open(&out, &ckpt, resume).await.unwrap();
            sink.sender().write(record("aa", TaskStatus::Done)).await.unwrap();
            sink.close().await;
        }
        assert_eq!(std::fs::read_to_string(&out).unwrap().lines().count(), 2);

        let sink = ResultSink::open(&out, &ckpt, false).await.unwrap();
        sink.close().await;
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "");
        assert_eq!(std::fs::read_to_string(&ckpt).unwrap(), "");
    }
}
