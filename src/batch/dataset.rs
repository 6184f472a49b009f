//! 数据集加载与内容指纹
//!
//! JSONL：每行一个 JSON 对象，至少包含 `prompt` 字段，可选 `toolsets` 覆盖批量默认工具集。
//! 指纹由整条记录的规范化 JSON 计算，与行号无关。

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::batch::BatchError;

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
}

/// 从数据集读出的一个任务
#[derive(Debug, Clone)]
pub struct TaskRecord {
    /// 数据集中的行序（仅用于展示，不参与身份判定）
    pub index: usize,
    pub fingerprint: String,
    pub prompt: String,
    /// 记录自带的工具集；None 表示使用批量默认
    pub toolsets: Option<Vec<String>>,
    pub status: TaskStatus,
}

impl TaskRecord {
    /// 由 JSON 记录构建；缺少 prompt 时返回 None
    pub fn from_value(index: usize, value: &Value) -> Option<Self> {
        let prompt = value.get("prompt")?.as_str()?.trim();
        if prompt.is_empty() {
            return None;
        }
        let toolsets = value.get("toolsets").and_then(Value::as_array).map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        });
        Some(Self {
            index,
            fingerprint: fingerprint(value),
            prompt: prompt.to_string(),
            toolsets,
            status: TaskStatus::Pending,
        })
    }

    /// 会话与日志使用的任务标识（行号 + 指纹前缀）
    pub fn task_id(&self) -> String {
        let short = self.fingerprint.get(..12).unwrap_or(&self.fingerprint);
        format!("task_{}_{short}", self.index)
    }
}

/// 键排序、紧凑格式的 JSON
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for k in keys {
                out.insert(k.clone(), canonicalize(&map[k]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// 小写十六进制 SHA-256
pub fn fingerprint(value: &Value) -> String {
    let canonical = canonicalize(value).to_string();
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// 解析 JSONL 文本；空行跳过，无法解析或缺少 prompt 的行告警后跳过
pub fn parse_dataset(text: &str) -> Vec<TaskRecord> {
    let mut records = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(line = line_no + 1, error = %e, "skipping malformed dataset line");
                continue;
            }
        };
        match TaskRecord::from_value(line_no, &value) {
            Some(r) => records.push(r),
            None => tracing::warn!(line = line_no + 1, "skipping dataset line without a prompt"),
        }
    }
    records
}

/// 读取数据集文件；文件不可读或没有可用记录属于编排级错误
pub async fn load_dataset(path: &Path) -> Result<Vec<TaskRecord>, BatchError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| BatchError::Dataset {
            path: path.to_path_buf(),
            source,
        })?;
    let records = parse_dataset(&text);
    if records.is_empty() {
        return Err(BatchError::EmptyDataset(path.to_path_buf()));
    }
    tracing::info!(path = %path.display(), records = records.len(), "dataset loaded");
    Ok(records)
}
