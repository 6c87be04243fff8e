//! 序列执行器
//!
//! 严格按声明顺序执行序列中的步骤，在每一步前后发布进度，
//! 并在每一步之后判定该步骤上报的标签。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::executor::StepExecutor;
use crate::progress::{CurrentStep, Progress, ProgressSink, SequenceInfo};
use crate::results::{TagEvaluator, TruthyEvaluator};
use crate::sequence::{Sequence, TestId};
use crate::step::{Step, TestError};
use crate::tag::{Tag, TagValue};

/// 序列运行结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SequenceOutcome {
    /// 已执行步骤的通过标记
    pub step_passed: Vec<bool>,

    /// 已执行步骤的耗时
    pub step_duration: Vec<Duration>,

    /// 全部步骤上报的标签值，后执行的步骤覆盖先前的同名标签
    pub tag_values: BTreeMap<Tag, TagValue>,

    /// 失败标签，按首次失败顺序排列，不重复
    pub failed_tags: Vec<Tag>,

    /// 运行中记录的错误
    pub errors: Vec<TestError>,

    /// 致命错误信息
    pub fatal: Option<String>,

    /// 运行是否被取消
    pub cancelled: bool,
}

impl SequenceOutcome {
    pub fn is_passing(&self) -> bool {
        self.failed_tags.is_empty()
            && self.errors.is_empty()
            && self.fatal.is_none()
            && !self.cancelled
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.is_some()
    }

    pub fn total_duration(&self) -> Duration {
        self.step_duration.iter().sum()
    }

    fn mark_failed(&mut self, tag: &Tag) {
        if !self.failed_tags.contains(tag) {
            self.failed_tags.push(tag.clone());
        }
    }
}

/// 序列执行器
#[derive(Clone)]
pub struct Sequencer {
    executor: StepExecutor,
    evaluator: Arc<dyn TagEvaluator>,
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequencer {
    /// 使用真值判定器创建
    pub fn new() -> Self {
        Self {
            executor: StepExecutor::new(),
            evaluator: Arc::new(TruthyEvaluator),
        }
    }

    /// 替换标签判定器
    pub fn with_evaluator(mut self, evaluator: Arc<dyn TagEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// 执行一个序列
    pub async fn run_sequence(
        &self,
        test_id: TestId,
        sequence: &mut Sequence,
        cancel: &CancellationToken,
        sink: &dyn ProgressSink,
    ) -> SequenceOutcome {
        info!(
            "开始执行序列: {} (test_id: {}, 步骤数: {})",
            sequence.name,
            test_id,
            sequence.len()
        );

        let mut progress = Progress::new(SequenceInfo::of(sequence));
        let mut outcome = SequenceOutcome::default();

        if sequence.is_empty() {
            warn!("序列 {} 没有任何步骤", sequence.name);
            outcome.errors.push(TestError::EmptySequence {
                sequence: sequence.name.clone(),
            });
            sink.publish(&progress);
            return outcome;
        }

        for (index, step) in sequence.steps.iter_mut().enumerate() {
            if cancel.is_cancelled() {
                info!("序列 {} 在步骤 {} 之前被取消", sequence.name, index + 1);
                outcome.cancelled = true;
                break;
            }

            progress.current_step = Some(CurrentStep {
                index,
                name: step.name().to_string(),
            });
            sink.publish(&progress);

            let result = self.executor.execute(&mut **step, cancel).await;

            if let Some(err) = &result.error {
                if matches!(err, TestError::Cancelled { .. }) {
                    outcome.cancelled = true;
                }
                outcome.errors.push(err.clone());
            }

            let tags_passed = self.evaluate_tags(&**step, &mut outcome);
            let passed = result.passed && tags_passed;

            if !passed {
                let mut reported: Vec<Tag> = step.results().into_keys().collect();
                reported.sort();
                for tag in &reported {
                    outcome.mark_failed(tag);
                }
            }

            progress.record(passed, result.duration);
            outcome.step_passed.push(passed);
            outcome.step_duration.push(result.duration);
            sink.publish(&progress);

            debug!(
                "步骤 {}/{} ({}) 结束: {}",
                index + 1,
                progress.total(),
                step.name(),
                if passed { "通过" } else { "失败" }
            );

            if let Some(message) = result.fatal {
                error!("序列 {} 因致命错误终止: {}", sequence.name, message);
                outcome.errors.push(TestError::Fatal {
                    step: step.name().to_string(),
                    message: message.clone(),
                });
                outcome.fatal = Some(message);
                break;
            }

            if outcome.cancelled {
                break;
            }

            if !passed && !step.continue_on_fail() {
                warn!("步骤 {} 失败且不允许继续，终止序列", step.name());
                break;
            }
        }

        if cancel.is_cancelled() {
            outcome.cancelled = true;
        }

        progress.current_step = None;
        sink.publish(&progress);

        info!(
            "序列执行完成: {} (通过: {}, 已执行: {}/{}, 取消: {})",
            sequence.name,
            outcome.is_passing(),
            outcome.step_passed.len(),
            progress.total(),
            outcome.cancelled
        );

        outcome
    }

    /// 判定步骤上报的全部标签，返回是否全部通过
    fn evaluate_tags(&self, step: &dyn Step, outcome: &mut SequenceOutcome) -> bool {
        let results: BTreeMap<Tag, TagValue> = step.results().into_iter().collect();
        let mut all_passed = true;

        for (tag, value) in results {
            let passed = match self.evaluator.evaluate(&tag, &value) {
                Ok(passed) => passed,
                Err(e) => {
                    warn!("标签 {} 判定出错: {}", tag.id, e);
                    outcome.errors.push(TestError::TagEvaluation {
                        tag: tag.id.clone(),
                        message: e.to_string(),
                    });
                    false
                }
            };

            if !passed {
                debug!("标签未通过: {} = {}", tag, value);
                all_passed = false;
            }
            outcome.tag_values.insert(tag, value);
        }

        all_passed
    }
}
