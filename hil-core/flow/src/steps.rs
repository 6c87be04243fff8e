//! 内置步骤
//!
//! 用于演示序列和测试：空操作、休眠、运行失败、致命错误。

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::step::Step;
use crate::tag::{Tag, TagValue};

/// 内置步骤共用的可配置部分
#[derive(Debug, Clone)]
struct StepOptions {
    results: HashMap<Tag, TagValue>,
    continue_on_fail: bool,
}

impl Default for StepOptions {
    fn default() -> Self {
        Self {
            results: HashMap::new(),
            continue_on_fail: true,
        }
    }
}

macro_rules! step_options_builder {
    ($ty:ty) => {
        impl $ty {
            /// 执行后上报一个标签值
            pub fn with_result(mut self, tag: Tag, value: impl Into<TagValue>) -> Self {
                self.options.results.insert(tag, value.into());
                self
            }

            /// 设置失败后是否继续执行后续步骤 (默认继续)
            pub fn with_continue_on_fail(mut self, continue_on_fail: bool) -> Self {
                self.options.continue_on_fail = continue_on_fail;
                self
            }
        }
    };
}

/// 什么都不做的步骤
#[derive(Debug, Clone, Default)]
pub struct NoopStep {
    options: StepOptions,
}

impl NoopStep {
    pub fn new() -> Self {
        Self::default()
    }
}

step_options_builder!(NoopStep);

#[async_trait]
impl Step for NoopStep {
    fn name(&self) -> &str {
        "noop_step"
    }

    async fn setup(&mut self, _cancel: &CancellationToken) -> anyhow::Result<()> {
        Ok(())
    }

    async fn run(&mut self, _cancel: &CancellationToken) -> anyhow::Result<()> {
        Ok(())
    }

    fn results(&self) -> HashMap<Tag, TagValue> {
        self.options.results.clone()
    }

    fn continue_on_fail(&self) -> bool {
        self.options.continue_on_fail
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(60)
    }
}

/// 休眠指定时长的步骤，超时为休眠时长 + 1 秒
#[derive(Debug, Clone)]
pub struct SleepStep {
    sleep: Duration,
    options: StepOptions,
}

impl SleepStep {
    pub fn new(sleep: Duration) -> Self {
        Self {
            sleep,
            options: StepOptions::default(),
        }
    }
}

step_options_builder!(SleepStep);

#[async_trait]
impl Step for SleepStep {
    fn name(&self) -> &str {
        "sleep_step"
    }

    async fn setup(&mut self, _cancel: &CancellationToken) -> anyhow::Result<()> {
        Ok(())
    }

    async fn run(&mut self, cancel: &CancellationToken) -> anyhow::Result<()> {
        tokio::select! {
            _ = tokio::time::sleep(self.sleep) => Ok(()),
            _ = cancel.cancelled() => anyhow::bail!("休眠被取消"),
        }
    }

    fn results(&self) -> HashMap<Tag, TagValue> {
        self.options.results.clone()
    }

    fn continue_on_fail(&self) -> bool {
        self.options.continue_on_fail
    }

    fn timeout(&self) -> Duration {
        self.sleep + Duration::from_secs(1)
    }
}

/// run 阶段总是返回错误的步骤
#[derive(Debug, Clone, Default)]
pub struct RunErrorStep {
    options: StepOptions,
}

impl RunErrorStep {
    pub fn new() -> Self {
        Self::default()
    }
}

step_options_builder!(RunErrorStep);

#[async_trait]
impl Step for RunErrorStep {
    fn name(&self) -> &str {
        "run_error_step"
    }

    async fn setup(&mut self, _cancel: &CancellationToken) -> anyhow::Result<()> {
        Ok(())
    }

    async fn run(&mut self, _cancel: &CancellationToken) -> anyhow::Result<()> {
        anyhow::bail!("there has been an error")
    }

    fn results(&self) -> HashMap<Tag, TagValue> {
        self.options.results.clone()
    }

    fn continue_on_fail(&self) -> bool {
        self.options.continue_on_fail
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(60)
    }
}

/// run 失败并报告致命错误的步骤
#[derive(Debug, Clone, Default)]
pub struct FatalErrorStep {
    options: StepOptions,
    fatal: Option<String>,
}

impl FatalErrorStep {
    pub fn new() -> Self {
        Self::default()
    }
}

step_options_builder!(FatalErrorStep);

#[async_trait]
impl Step for FatalErrorStep {
    fn name(&self) -> &str {
        "run_fatal_error_step"
    }

    async fn setup(&mut self, _cancel: &CancellationToken) -> anyhow::Result<()> {
        Ok(())
    }

    async fn run(&mut self, _cancel: &CancellationToken) -> anyhow::Result<()> {
        self.fatal = Some("there has been a fatal run error".to_string());
        anyhow::bail!("there has been a run error")
    }

    fn results(&self) -> HashMap<Tag, TagValue> {
        self.options.results.clone()
    }

    fn continue_on_fail(&self) -> bool {
        self.options.continue_on_fail
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(60)
    }

    fn fatal_error(&self) -> Option<String> {
        self.fatal.clone()
    }
}
