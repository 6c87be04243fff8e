//! 步骤契约

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::tag::{Tag, TagValue};

/// 测试步骤
///
/// 所有具体步骤 (刷写、总线追踪、IO 操作等) 必须实现此 trait。
/// 步骤实例由所属序列独占，不会在并发运行之间共享。
///
/// `setup` 和 `run` 收到的取消令牌在运行被取消时触发，
/// 步骤应在合适的挂起点观察它并尽快返回。
#[async_trait]
pub trait Step: Send + Sync {
    /// 步骤名称 (lower_snake_case)
    fn name(&self) -> &str;

    /// 执行前的准备工作，返回错误时不会调用 `run`
    async fn setup(&mut self, cancel: &CancellationToken) -> anyhow::Result<()>;

    /// 步骤主体逻辑
    async fn run(&mut self, cancel: &CancellationToken) -> anyhow::Result<()>;

    /// 步骤执行后上报的标签值
    fn results(&self) -> HashMap<Tag, TagValue> {
        HashMap::new()
    }

    /// 失败后是否继续执行序列中后续步骤
    fn continue_on_fail(&self) -> bool {
        false
    }

    /// setup + run 的总时长上限
    fn timeout(&self) -> Duration;

    /// 不可恢复错误 (通常是硬件故障)，非空时整个系统进入致命错误状态
    fn fatal_error(&self) -> Option<String> {
        None
    }
}

/// 测试错误记录
///
/// 跨组件边界传递时错误一律以数据形式出现，可克隆、可序列化。
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TestError {
    #[error("setup ({step}): {message}")]
    Setup { step: String, message: String },

    #[error("run ({step}): {message}")]
    Run { step: String, message: String },

    #[error("步骤超时 ({step}): 超过 {timeout_ms} ms")]
    DeadlineExceeded { step: String, timeout_ms: u64 },

    #[error("步骤已取消 ({step})")]
    Cancelled { step: String },

    #[error("步骤异常中止 ({step}): {message}")]
    Panicked { step: String, message: String },

    #[error("致命错误 ({step}): {message}")]
    Fatal { step: String, message: String },

    #[error("标签判定失败 ({tag}): {message}")]
    TagEvaluation { tag: String, message: String },

    #[error("序列为空: {sequence}")]
    EmptySequence { sequence: String },

    #[error("测试请求被拒绝: {reason}")]
    Rejected { reason: String },

    #[error("序列执行任务异常退出: {message}")]
    RunnerAborted { message: String },
}

impl TestError {
    /// 关联的步骤名称
    pub fn step(&self) -> Option<&str> {
        match self {
            TestError::Setup { step, .. }
            | TestError::Run { step, .. }
            | TestError::DeadlineExceeded { step, .. }
            | TestError::Cancelled { step }
            | TestError::Panicked { step, .. }
            | TestError::Fatal { step, .. } => Some(step),
            _ => None,
        }
    }
}
