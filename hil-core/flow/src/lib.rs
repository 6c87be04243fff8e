//! HIL 测试流程
//!
//! 步骤契约、序列定义、单步执行器与序列执行器

pub mod executor;
pub mod progress;
pub mod results;
pub mod sequence;
pub mod sequencer;
pub mod step;
pub mod steps;
pub mod tag;

pub use executor::{StepExecutor, StepOutcome, StepStatus};
pub use progress::{CurrentStep, Progress, ProgressSink, SequenceInfo};
pub use results::{
    ComparisonOperator, MemoryAccumulator, ResultsAccumulator, RunReport, TagEvaluator, TagRule,
    TagRuleTable, TruthyEvaluator,
};
pub use sequence::{CatalogEntry, Sequence, SequenceCatalog, TestId};
pub use sequencer::{SequenceOutcome, Sequencer};
pub use step::{Step, TestError};
pub use steps::{FatalErrorStep, NoopStep, RunErrorStep, SleepStep};
pub use tag::{Tag, TagValue};

/// 重新导出取消令牌，步骤实现无需直接依赖 tokio-util
pub use tokio_util::sync::CancellationToken;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("序列不存在: {0}")]
    SequenceNotFound(String),

    #[error("序列已注册: {0}")]
    DuplicateSequence(String),

    #[error("标签未定义: {0}")]
    UnknownTag(String),

    #[error("标签判定失败: {0}")]
    TagRule(String),

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    SerdeError(String),
}

pub type Result<T> = std::result::Result<T, FlowError>;
