//! 序列运行进度

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::sequence::Sequence;

/// 序列快照 (只读，不含步骤实例)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceInfo {
    pub name: String,
    pub description: String,
    pub step_names: Vec<String>,
}

impl SequenceInfo {
    pub fn of(sequence: &Sequence) -> Self {
        Self {
            name: sequence.name.clone(),
            description: sequence.description.clone(),
            step_names: sequence.steps.iter().map(|s| s.name().to_string()).collect(),
        }
    }
}

/// 正在执行的步骤
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentStep {
    pub index: usize,
    pub name: String,
}

/// 当前运行的进度
///
/// `step_passed` 与 `step_duration` 长度始终相等，运行期间只增不减。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub sequence: SequenceInfo,
    pub current_step: Option<CurrentStep>,
    pub step_passed: Vec<bool>,
    pub step_duration: Vec<Duration>,
}

impl Progress {
    pub fn new(sequence: SequenceInfo) -> Self {
        Self {
            sequence,
            current_step: None,
            step_passed: Vec::new(),
            step_duration: Vec::new(),
        }
    }

    /// 已完成的步骤数
    pub fn completed(&self) -> usize {
        self.step_passed.len()
    }

    /// 序列总步骤数
    pub fn total(&self) -> usize {
        self.sequence.step_names.len()
    }

    pub(crate) fn record(&mut self, passed: bool, duration: Duration) {
        self.step_passed.push(passed);
        self.step_duration.push(duration);
    }
}

/// 进度接收端
pub trait ProgressSink: Send + Sync {
    fn publish(&self, progress: &Progress);
}

impl<F> ProgressSink for F
where
    F: Fn(&Progress) + Send + Sync,
{
    fn publish(&self, progress: &Progress) {
        self(progress)
    }
}
