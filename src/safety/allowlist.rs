//! 持久化审批白名单
//!
//! 进程级共享：启动时 load，变更时 save。读多写少：读走 RwLock，写由一把异步 Mutex 串行化，
//! 落盘先写临时文件再 rename，崩溃时不会留下半截文件。

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("allowlist io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("allowlist parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("allowlist serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AllowlistFile {
    #[serde(default)]
    patterns: Vec<String>,
}

/// 审批白名单（按危险模式 key 记录「永久允许」）
#[derive(Debug)]
pub struct ApprovalAllowlist {
    path: Option<PathBuf>,
    patterns: RwLock<BTreeSet<String>>,
    write_lock: Mutex<()>,
}

impl ApprovalAllowlist {
    /// 仅内存，不落盘
    pub fn in_memory() -> Self {
        Self {
            path: None,
            patterns: RwLock::new(BTreeSet::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// 从文件加载；文件不存在时为空
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ApprovalError> {
        let path = path.into();
        let patterns = match std::fs::read_to_string(&path) {
            Ok(raw) => toml::from_str::<AllowlistFile>(&raw)?.patterns.into_iter().collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(path = %path.display(), count = patterns.len(), "approval allowlist loaded");
        Ok(Self {
            path: Some(path),
            patterns: RwLock::new(patterns),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.patterns
            .read()
            .map(|set| set.contains(key))
            .unwrap_or(false)
    }

    pub fn patterns(&self) -> Vec<String> {
        self.patterns
            .read()
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// 加入白名单并立即保存
    pub async fn add(&self, key: &str) -> Result<(), ApprovalError> {
        let _guard = self.write_lock.lock().await;
        let inserted = match self.patterns.write() {
            Ok(mut set) => set.insert(key.to_string()),
            Err(poisoned) => poisoned.into_inner().insert(key.to_string()),
        };
        if inserted {
            self.save_locked().await?;
            tracing::info!(pattern = %key, "pattern added to approval allowlist");
        }
        Ok(())
    }

    /// 显式保存
    pub async fn save(&self) -> Result<(), ApprovalError> {
        let _guard = self.write_lock.lock().await;
        self.save_locked().await
    }

    async fn save_locked(&self) -> Result<(), ApprovalError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = AllowlistFile {
            patterns: self.patterns(),
        };
        let body = toml::to_string_pretty(&file)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("toml.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn test_add_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("approvals.toml");
        let list = ApprovalAllowlist::load(&path).unwrap();
        assert!(!list.contains("recursive_delete"));

        list.add("recursive_delete").await.unwrap();
        list.add("recursive_delete").await.unwrap();
        assert!(list.contains("recursive_delete"));

        let reloaded = ApprovalAllowlist::load(&path).unwrap();
        assert_eq!(reloaded.patterns(), vec!["recursive_delete".to_string()]);
    }

    #[tokio::test]
    async fn test_concurrent_adds_are_all_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("approvals.toml");
        let list = Arc::new(ApprovalAllowlist::load(&path).unwrap());
        let mut handles = Vec::new();
        for i in 0..8 {
            let list = list.clone();
            handles.push(tokio::spawn(async move { list.add(&format!("p{i}")).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(ApprovalAllowlist::load(&path).unwrap().patterns().len(), 8);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("approvals.toml");
        std::fs::write(&path, "patterns = [unterminated").unwrap();
        assert!(matches!(ApprovalAllowlist::load(&path), Err(ApprovalError::Parse(_))));
    }
}
