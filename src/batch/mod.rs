//! 批量编排：数据集、检查点、结果写入、统计与 worker 池

pub mod checkpoint;
pub mod dataset;
pub mod error;
pub mod runner;
pub mod sink;
pub mod stats;

pub use checkpoint::{load_checkpoint, parse_checkpoint, CheckpointEntry};
pub use dataset::{fingerprint, load_dataset, parse_dataset, TaskRecord, TaskStatus};
pub use error::BatchError;
pub use runner::{
    BatchOptions, BatchRunner, TaskRequest, TaskRunner, CHECKPOINT_FILE, OUTPUT_FILE, STATISTICS_FILE,
};
pub use sink::{OutputRecord, ResultSink, SinkSender};
pub use stats::{ActionStats, BatchStats, StatisticsReport};
