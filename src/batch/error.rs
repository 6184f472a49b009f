//! 编排级致命错误：数据集不可读、输出或检查点不可写。单个任务的失败不会出现在这里。

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Cannot read dataset {path}: {source}")]
    Dataset {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Dataset {0} contains no usable records")]
    EmptyDataset(PathBuf),

    #[error("Cannot read checkpoint {path}: {source}")]
    Checkpoint {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Result writer stopped unexpectedly")]
    SinkClosed,
}
