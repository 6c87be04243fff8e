//! 单步执行器

use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::step::{Step, TestError};

/// 单步执行结果
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    /// 是否通过
    pub passed: bool,

    /// setup + run 耗时
    pub duration: Duration,

    /// setup/run 阶段的错误
    pub error: Option<TestError>,

    /// 致命错误信息 (来自 `Step::fatal_error`)，非空即为致命
    pub fatal: Option<String>,
}

impl StepOutcome {
    pub fn is_fatal(&self) -> bool {
        self.fatal.is_some()
    }

    pub fn status(&self) -> StepStatus {
        if self.fatal.is_some() {
            return StepStatus::Fatal;
        }
        match &self.error {
            None => StepStatus::Passed,
            Some(TestError::DeadlineExceeded { .. }) => StepStatus::TimedOut,
            Some(TestError::Cancelled { .. }) => StepStatus::Cancelled,
            Some(_) => StepStatus::Failed,
        }
    }
}

/// 步骤状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Passed,
    Failed,
    TimedOut,
    Cancelled,
    Fatal,
}

/// 阶段失败原因
enum PhaseFailure {
    Failed(anyhow::Error),
    TimedOut,
    Panicked(String),
}

#[derive(Clone, Copy)]
enum Phase {
    Setup,
    Run,
}

/// 单步执行器
///
/// 在截止时间和取消令牌下运行一个步骤的 setup 与 run 阶段，
/// 并把原始结果归类为 通过 / 失败 / 超时 / 取消 / 致命。
/// 本层不做任何重试。
#[derive(Debug, Clone, Default)]
pub struct StepExecutor;

impl StepExecutor {
    pub fn new() -> Self {
        Self
    }

    /// 执行单个步骤
    pub async fn execute(&self, step: &mut dyn Step, cancel: &CancellationToken) -> StepOutcome {
        let name = step.name().to_string();
        let step_timeout = step.timeout();
        let start = Instant::now();
        // 超时过大 (例如 Duration::MAX) 时不设截止时间
        let deadline = start.checked_add(step_timeout);

        debug!("准备步骤: {} (超时: {:?})", name, step_timeout);
        let mut failure = guarded(step.setup(cancel), deadline)
            .await
            .err()
            .map(|f| (Phase::Setup, f));

        if failure.is_none() {
            info!("运行步骤: {}", name);
            failure = guarded(step.run(cancel), deadline)
                .await
                .err()
                .map(|f| (Phase::Run, f));
        }

        let duration = start.elapsed();

        let panicked = matches!(failure, Some((_, PhaseFailure::Panicked(_))));
        let error = failure.map(|(phase, f)| classify(&name, phase, f, step_timeout, cancel));

        // 异常中止的步骤状态不可信，不再查询致命错误
        let fatal = if panicked { None } else { step.fatal_error() };

        if let Some(message) = &fatal {
            error!("步骤 {} 报告致命错误: {}", name, message);
        }
        match &error {
            Some(TestError::Panicked { message, .. }) => {
                error!("步骤 {} 异常中止: {}", name, message);
            }
            Some(TestError::Cancelled { .. }) => warn!("步骤 {} 已取消", name),
            Some(e) => warn!("步骤 {} 失败: {}", name, e),
            None => debug!("步骤 {} 完成，耗时 {:?}", name, duration),
        }

        StepOutcome {
            passed: error.is_none() && fatal.is_none(),
            duration,
            error,
            fatal,
        }
    }
}

/// 在截止时间内运行一个阶段，并捕获阶段内的 panic
async fn guarded<F>(phase: F, deadline: Option<Instant>) -> Result<(), PhaseFailure>
where
    F: Future<Output = anyhow::Result<()>>,
{
    let phase = AssertUnwindSafe(phase).catch_unwind();
    let result = match deadline {
        Some(deadline) => timeout_at(deadline, phase)
            .await
            .map_err(|_| PhaseFailure::TimedOut)?,
        None => phase.await,
    };

    match result {
        Err(payload) => Err(PhaseFailure::Panicked(panic_message(payload.as_ref()))),
        Ok(Err(e)) => Err(PhaseFailure::Failed(e)),
        Ok(Ok(())) => Ok(()),
    }
}

fn classify(
    step: &str,
    phase: Phase,
    failure: PhaseFailure,
    step_timeout: Duration,
    cancel: &CancellationToken,
) -> TestError {
    let step = step.to_string();
    match failure {
        PhaseFailure::TimedOut => TestError::DeadlineExceeded {
            step,
            timeout_ms: step_timeout.as_millis() as u64,
        },
        PhaseFailure::Panicked(message) => TestError::Panicked { step, message },
        PhaseFailure::Failed(_) if cancel.is_cancelled() => TestError::Cancelled { step },
        PhaseFailure::Failed(e) => {
            let message = format!("{:#}", e);
            match phase {
                Phase::Setup => TestError::Setup { step, message },
                Phase::Run => TestError::Run { step, message },
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// 可配置行为的测试步骤
    #[derive(Default)]
    struct ScriptedStep {
        setup_error: bool,
        run_error: bool,
        run_sleep: Option<Duration>,
        honor_cancel: bool,
        panic_in_run: bool,
        fatal: Option<String>,
        timeout: Option<Duration>,
        run_called: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Step for ScriptedStep {
        fn name(&self) -> &str {
            "scripted_step"
        }

        async fn setup(&mut self, _cancel: &CancellationToken) -> anyhow::Result<()> {
            if self.setup_error {
                anyhow::bail!("setup broke");
            }
            Ok(())
        }

        async fn run(&mut self, cancel: &CancellationToken) -> anyhow::Result<()> {
            self.run_called.store(true, Ordering::SeqCst);
            if self.panic_in_run {
                panic!("boom");
            }
            if let Some(d) = self.run_sleep {
                if self.honor_cancel {
                    tokio::select! {
                        _ = tokio::time::sleep(d) => {}
                        _ = cancel.cancelled() => anyhow::bail!("interrupted"),
                    }
                } else {
                    tokio::time::sleep(d).await;
                }
            }
            if self.run_error {
                anyhow::bail!("run broke");
            }
            Ok(())
        }

        fn timeout(&self) -> Duration {
            self.timeout.unwrap_or(Duration::from_secs(5))
        }

        fn fatal_error(&self) -> Option<String> {
            self.fatal.clone()
        }
    }

    #[tokio::test]
    async fn test_passing_step() {
        let mut step = ScriptedStep::default();
        let outcome = StepExecutor::new()
            .execute(&mut step, &CancellationToken::new())
            .await;
        assert!(outcome.passed);
        assert!(outcome.error.is_none());
        assert_eq!(outcome.status(), StepStatus::Passed);
    }

    #[tokio::test]
    async fn test_setup_failure_skips_run() {
        let run_called = Arc::new(AtomicBool::new(false));
        let mut step = ScriptedStep {
            setup_error: true,
            run_called: run_called.clone(),
            ..Default::default()
        };
        let outcome = StepExecutor::new()
            .execute(&mut step, &CancellationToken::new())
            .await;

        assert!(!outcome.passed);
        assert!(matches!(outcome.error, Some(TestError::Setup { .. })));
        assert!(!run_called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_run_failure() {
        let mut step = ScriptedStep {
            run_error: true,
            ..Default::default()
        };
        let outcome = StepExecutor::new()
            .execute(&mut step, &CancellationToken::new())
            .await;
        match &outcome.error {
            Some(TestError::Run { step, message }) => {
                assert_eq!(step, "scripted_step");
                assert!(message.contains("run broke"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(outcome.status(), StepStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_exceeded() {
        let mut step = ScriptedStep {
            run_sleep: Some(Duration::from_secs(1)),
            timeout: Some(Duration::from_millis(100)),
            ..Default::default()
        };
        let outcome = StepExecutor::new()
            .execute(&mut step, &CancellationToken::new())
            .await;

        assert!(!outcome.passed);
        assert!(matches!(
            outcome.error,
            Some(TestError::DeadlineExceeded { timeout_ms: 100, .. })
        ));
        assert!(outcome.duration >= Duration::from_millis(100));
        assert!(outcome.duration < Duration::from_secs(1));
        assert_eq!(outcome.status(), StepStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_unbounded_timeout_does_not_overflow() {
        let mut step = ScriptedStep {
            run_sleep: Some(Duration::from_millis(5)),
            timeout: Some(Duration::MAX),
            ..Default::default()
        };
        let outcome = StepExecutor::new()
            .execute(&mut step, &CancellationToken::new())
            .await;

        assert!(outcome.passed);
        assert!(outcome.error.is_none());
        assert!(step.run_called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_fatal_is_side_channel() {
        // run 本身成功，但 fatal_error 非空
        let mut step = ScriptedStep {
            fatal: Some("contactor welded".to_string()),
            ..Default::default()
        };
        let outcome = StepExecutor::new()
            .execute(&mut step, &CancellationToken::new())
            .await;

        assert!(!outcome.passed);
        assert!(outcome.is_fatal());
        assert!(outcome.error.is_none());
        assert_eq!(outcome.status(), StepStatus::Fatal);
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let mut step = ScriptedStep {
            panic_in_run: true,
            fatal: Some("ignored".to_string()),
            ..Default::default()
        };
        let outcome = StepExecutor::new()
            .execute(&mut step, &CancellationToken::new())
            .await;

        assert!(!outcome.passed);
        assert!(!outcome.is_fatal());
        match outcome.error {
            Some(TestError::Panicked { message, .. }) => assert_eq!(message, "boom"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooperative_cancellation() {
        let cancel = CancellationToken::new();
        let mut step = ScriptedStep {
            run_sleep: Some(Duration::from_secs(3)),
            honor_cancel: true,
            ..Default::default()
        };

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let outcome = StepExecutor::new().execute(&mut step, &cancel).await;
        assert_eq!(outcome.status(), StepStatus::Cancelled);
        assert!(outcome.duration < Duration::from_secs(3));
    }
}
