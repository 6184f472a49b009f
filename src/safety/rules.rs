//! 危险命令模式表
//!
//! 以显式数据声明（key / 描述 / 正则），便于审计；匹配到的 key 同时是持久化白名单的键。
//! 只检查命令字符串本身，不关心由哪个动作发出。

use regex::{Regex, RegexBuilder};

/// 一条危险模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DangerousPattern {
    pub key: &'static str,
    pub description: &'static str,
    pub regex: &'static str,
}

/// 危险模式表（大小写不敏感）
pub const DANGEROUS_PATTERNS: &[DangerousPattern] = &[
    DangerousPattern {
        key: "recursive_delete",
        description: "recursive delete",
        regex: r"\brm\s+(-\S*[rR]\S*|--recursive)\b",
    },
    DangerousPattern {
        key: "find_delete",
        description: "find with -delete",
        regex: r"\bfind\b.*\s-delete\b",
    },
    DangerousPattern {
        key: "privilege_escalation",
        description: "privilege escalation (sudo / su / pkexec)",
        regex: r"(^|[;&|(]\s*)(sudo|su|pkexec|doas)(\s|$)",
    },
    DangerousPattern {
        key: "sql_drop",
        description: "SQL DROP statement",
        regex: r"\bdrop\s+(table|database|schema|index|view)\b",
    },
    DangerousPattern {
        key: "sql_truncate",
        description: "SQL TRUNCATE statement",
        regex: r"\btruncate\s+(table\s+)?[\w.`]+",
    },
    DangerousPattern {
        key: "sql_delete_without_where",
        description: "SQL DELETE without WHERE",
        regex: r#"\bdelete\s+from\s+[\w.`"]+\s*(;|"|'|$)"#,
    },
    DangerousPattern {
        key: "world_writable_chmod",
        description: "world-writable permission change",
        regex: r"\bchmod\s+(-\S+\s+)*(0?777|0?666|a\+w|o\+w)\b",
    },
    DangerousPattern {
        key: "recursive_chown",
        description: "recursive ownership change",
        regex: r"\bchown\s+(-\S*R\S*|--recursive)\b",
    },
    DangerousPattern {
        key: "mkfs",
        description: "filesystem format",
        regex: r"\bmkfs(\.\w+)?\b",
    },
    DangerousPattern {
        key: "dd_to_device",
        description: "dd write",
        regex: r"\bdd\s+.*\bof=",
    },
    DangerousPattern {
        key: "block_device_write",
        description: "write to block device",
        regex: r">\s*/dev/(sd|nvme|hd|vd)[a-z0-9]*",
    },
    DangerousPattern {
        key: "fork_bomb",
        description: "fork bomb",
        regex: r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
    },
    DangerousPattern {
        key: "pipe_to_shell",
        description: "remote script piped to shell",
        regex: r"\b(curl|wget)\b.*\|\s*(sudo\s+)?(ba|z|da)?sh\b",
    },
    DangerousPattern {
        key: "system_service_change",
        description: "system service change",
        regex: r"\bsystemctl\s+(stop|disable|mask|restart)\b",
    },
];

/// 编译后的模式表
pub struct PatternRules {
    compiled: Vec<(Regex, &'static DangerousPattern)>,
}

impl PatternRules {
    pub fn new() -> Self {
        let compiled = DANGEROUS_PATTERNS
            .iter()
            .filter_map(|p| {
                match RegexBuilder::new(p.regex).case_insensitive(true).build() {
                    Ok(re) => Some((re, p)),
                    Err(e) => {
                        tracing::error!(key = p.key, error = %e, "invalid dangerous pattern, skipped");
                        None
                    }
                }
            })
            .collect();
        Self { compiled }
    }

    /// 返回第一条匹配的危险模式
    pub fn detect(&self, command: &str) -> Option<&'static DangerousPattern> {
        self.detect_all(command).into_iter().next()
    }

    /// 返回所有匹配的危险模式（按表内顺序）；链式命令可能同时命中多条
    pub fn detect_all(&self, command: &str) -> Vec<&'static DangerousPattern> {
        self.compiled
            .iter()
            .filter(|(re, _)| re.is_match(command))
            .map(|(_, p)| *p)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }
}

impl Default for PatternRules {
    fn default() -> Self {
        Self::new()
    }
}
