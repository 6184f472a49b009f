//! 检查点：已完成任务的指纹集合，追加写入 checkpoint.jsonl
//!
//! 读取宽容：每行可以是 JSON 对象（含 `fingerprint`）、JSON 字符串或裸指纹；
//! 无法识别的行告警后跳过，未知字段忽略，保证新版本能读旧文件。

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::batch::BatchError;

/// 检查点中的一行
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

impl CheckpointEntry {
    pub fn new(fingerprint: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            task_id: Some(task_id.into()),
            completed_at: Some(chrono::Utc::now().to_rfc3339()),
        }
    }
}

fn is_fingerprint(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit())
}

fn parse_line(line: &str) -> Option<String> {
    match serde_json::from_str::<Value>(line) {
        Ok(Value::String(s)) => Some(s),
        Ok(Value::Object(map)) => map.get("fingerprint").and_then(Value::as_str).map(String::from),
        Ok(_) => None,
        Err(_) if is_fingerprint(line) => Some(line.to_string()),
        Err(_) => None,
    }
}

pub fn parse_checkpoint(text: &str) -> HashSet<String> {
    let mut done = HashSet::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_line(line) {
            Some(fp) => {
                done.insert(fp.to_ascii_lowercase());
            }
            None => tracing::warn!(line = line_no + 1, "skipping unreadable checkpoint line"),
        }
    }
    done
}

/// 读取检查点；文件不存在时为空集合
pub async fn load_checkpoint(path: &Path) -> Result<HashSet<String>, BatchError> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(parse_checkpoint(&text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashSet::new()),
        Err(source) => Err(BatchError::Checkpoint {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_mixed_formats() {
        let text = r#"{"fingerprint": "abc123", "task_id": "task_0", "future_field": 1}
"DEF456"
0a0b0c
{"other": 1}
[1, 2]
"#;
        let done = parse_checkpoint(text);
        assert_eq!(done.len(), 3);
        assert!(done.contains("abc123"));
        assert!(done.contains("def456"));
        assert!(done.contains("0a0b0c"));
    }

    #[test]
    fn test_entry_serializes_compactly() {
        let line = serde_json::to_string(&CheckpointEntry::new("ff", "task_1")).unwrap();
        assert!(line.contains(r#""fingerprint":"ff""#));
        assert!(line.contains("completed_at"));
        assert_eq!(parse_checkpoint(&line).len(), 1);
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let done = load_checkpoint(&dir.path().join("checkpoint.jsonl")).await.unwrap();
        assert!(done.is_empty());
    }
}
