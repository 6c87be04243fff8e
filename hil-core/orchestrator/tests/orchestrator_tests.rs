//! Orchestrator 集成测试

use async_channel::Receiver;
use async_trait::async_trait;
use hil_flow::{
    CancellationToken, FatalErrorStep, MemoryAccumulator, NoopStep, Sequence, Sequencer,
    SleepStep, Step, Tag, TagValue, TestError,
};
use hil_orchestrator::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// 记录执行顺序的步骤
struct SpyStep {
    label: String,
    runs: Arc<AtomicUsize>,
    order: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Step for SpyStep {
    fn name(&self) -> &str {
        "spy_step"
    }

    async fn setup(&mut self, _cancel: &CancellationToken) -> anyhow::Result<()> {
        Ok(())
    }

    async fn run(&mut self, _cancel: &CancellationToken) -> anyhow::Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.order.lock().unwrap().push(self.label.clone());
        Ok(())
    }

    fn results(&self) -> HashMap<Tag, TagValue> {
        HashMap::from([(Tag::new("SPY", "spy ran"), TagValue::Bool(true))])
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(1)
    }
}

#[derive(Clone, Default)]
struct Spy {
    runs: Arc<AtomicUsize>,
    order: Arc<Mutex<Vec<String>>>,
}

impl Spy {
    fn sequence(&self, label: &str) -> Sequence {
        Sequence::new(label, "spy").with_step(SpyStep {
            label: label.to_string(),
            runs: self.runs.clone(),
            order: self.order.clone(),
        })
    }

    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    fn order(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }
}

/// 不响应取消的步骤
struct StubbornStep;

#[async_trait]
impl Step for StubbornStep {
    fn name(&self) -> &str {
        "stubborn_step"
    }

    async fn setup(&mut self, _cancel: &CancellationToken) -> anyhow::Result<()> {
        Ok(())
    }

    async fn run(&mut self, _cancel: &CancellationToken) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(120)
    }
}

fn sleeper() -> Sequence {
    Sequence::new("sleeper", "")
        .with_step(SleepStep::new(Duration::from_secs(5)))
        .with_step(NoopStep::new())
}

fn fatal() -> Sequence {
    Sequence::new("fatal", "")
        .with_step(NoopStep::new())
        .with_step(FatalErrorStep::new())
}

struct Harness {
    handle: OrchestratorHandle,
    updates: Receiver<CoreUpdate>,
    task: JoinHandle<()>,
}

async fn spawn_with(orchestrator: Orchestrator, handle: OrchestratorHandle) -> Harness {
    let updates = handle.subscribe().await.unwrap();
    let task = tokio::spawn(orchestrator.run(CancellationToken::new()));
    // 订阅时推送的初始状态
    match updates.recv().await.unwrap() {
        CoreUpdate::Status(status) => assert_eq!(status.state, OrchestratorState::Idle),
        other => panic!("unexpected update: {:?}", other),
    }
    Harness {
        handle,
        updates,
        task,
    }
}

async fn spawn(config: OrchestratorConfig) -> Harness {
    let (orchestrator, handle) = Orchestrator::new(Sequencer::new(), config);
    spawn_with(orchestrator, handle).await
}

async fn next_update(rx: &Receiver<CoreUpdate>) -> CoreUpdate {
    timeout(Duration::from_secs(60), rx.recv())
        .await
        .expect("等待更新超时")
        .expect("订阅通道已关闭")
}

async fn next_result(rx: &Receiver<CoreUpdate>) -> ResultSignal {
    loop {
        if let CoreUpdate::Result(result) = next_update(rx).await {
            return result;
        }
    }
}

/// 等待当前运行进入第一个步骤
async fn wait_first_step(rx: &Receiver<CoreUpdate>) -> StatusSignal {
    loop {
        if let CoreUpdate::Status(status) = next_update(rx).await {
            let in_step = status
                .progress
                .as_ref()
                .map(|p| p.current_step.is_some())
                .unwrap_or(false);
            if in_step {
                return status;
            }
        }
    }
}

#[tokio::test]
async fn test_single_run_passes() {
    init_tracing();
    let h = spawn(OrchestratorConfig::default()).await;

    let test_id = h
        .handle
        .start(StartSignal::new(Sequence::new("noop", "").with_step(NoopStep::new())))
        .await
        .unwrap();

    let result = next_result(&h.updates).await;
    assert_eq!(result.test_id, test_id);
    assert!(result.is_passing);
    assert!(!result.cancelled);

    let status = h.handle.status().await.unwrap();
    assert_eq!(status.state, OrchestratorState::Idle);
    assert_eq!(status.queue_length, 0);
    assert!(status.test_id.is_none());
}

#[tokio::test]
async fn test_status_progress_arrays_stay_aligned() {
    init_tracing();
    let h = spawn(OrchestratorConfig::default()).await;

    let seq = Sequence::new("three", "")
        .with_step(NoopStep::new())
        .with_step(NoopStep::new())
        .with_step(NoopStep::new());
    h.handle.start(StartSignal::new(seq)).await.unwrap();

    let mut statuses = Vec::new();
    loop {
        match next_update(&h.updates).await {
            CoreUpdate::Status(status) => statuses.push(status),
            CoreUpdate::Result(_) => break,
        }
    }

    let mut last = 0;
    for progress in statuses.iter().filter_map(|s| s.progress.as_ref()) {
        assert_eq!(progress.step_passed.len(), progress.step_duration.len());
        assert!(progress.step_passed.len() <= progress.total());
        assert!(progress.step_passed.len() >= last);
        last = progress.step_passed.len();
    }
    assert_eq!(last, 3);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_queued_run_never_invokes_steps() {
    init_tracing();
    let h = spawn(OrchestratorConfig::default()).await;
    let spy = Spy::default();

    let running = h.handle.start(StartSignal::new(sleeper())).await.unwrap();
    let queued = h.handle.start(StartSignal::new(spy.sequence("queued"))).await.unwrap();
    wait_first_step(&h.updates).await;

    h.handle.cancel(queued).await.unwrap();
    let result = next_result(&h.updates).await;
    assert_eq!(result.test_id, queued);
    assert!(result.cancelled);
    assert!(!result.is_passing);

    h.handle.cancel(running).await.unwrap();
    let result = next_result(&h.updates).await;
    assert_eq!(result.test_id, running);
    assert!(result.cancelled);

    assert_eq!(spy.runs(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_running_stops_progress() {
    init_tracing();
    let h = spawn(OrchestratorConfig::default()).await;

    let test_id = h.handle.start(StartSignal::new(sleeper())).await.unwrap();
    let status = wait_first_step(&h.updates).await;
    assert_eq!(status.state, OrchestratorState::Running);
    assert_eq!(status.test_id, Some(test_id));

    let started = tokio::time::Instant::now();
    h.handle.cancel(test_id).await.unwrap();

    // 取消之后不再转发该运行的进度，下一条更新就是结果
    match next_update(&h.updates).await {
        CoreUpdate::Result(result) => {
            assert_eq!(result.test_id, test_id);
            assert!(result.cancelled);
            assert!(!result.is_passing);
            assert!(result
                .test_errors
                .iter()
                .any(|e| matches!(e, TestError::Cancelled { .. })));
        }
        other => panic!("expected result, got {:?}", other),
    }
    assert!(started.elapsed() < Duration::from_secs(6));
}

#[tokio::test]
async fn test_cancel_immediately_after_start() {
    init_tracing();
    let h = spawn(OrchestratorConfig::default()).await;
    let spy = Spy::default();

    let test_id = h.handle.start(StartSignal::new(spy.sequence("a"))).await.unwrap();
    h.handle.cancel(test_id).await.unwrap();

    let result = next_result(&h.updates).await;
    assert!(result.cancelled);
    assert_eq!(spy.runs(), 0);
}

#[tokio::test]
async fn test_unknown_cancel_is_noop() {
    init_tracing();
    let h = spawn(OrchestratorConfig::default()).await;

    h.handle.cancel(uuid::Uuid::new_v4()).await.unwrap();
    let status = h.handle.status().await.unwrap();

    assert_eq!(status.state, OrchestratorState::Idle);
    assert!(h.updates.try_recv().is_err());
}

#[tokio::test]
async fn test_fatal_freezes_queue_until_recover() {
    init_tracing();
    let h = spawn(OrchestratorConfig::default()).await;
    let spy = Spy::default();

    h.handle.start(StartSignal::new(fatal())).await.unwrap();
    let result = next_result(&h.updates).await;
    assert!(!result.is_passing);

    let status = h.handle.status().await.unwrap();
    assert_eq!(status.state, OrchestratorState::FatalError);
    assert!(status.fatal_error.is_some());

    let mut ids = Vec::new();
    for label in ["a", "b", "c"] {
        ids.push(h.handle.start(StartSignal::new(spy.sequence(label))).await.unwrap());
    }

    let status = h.handle.status().await.unwrap();
    assert_eq!(status.state, OrchestratorState::FatalError);
    assert_eq!(status.queue_length, 3);
    assert_eq!(spy.runs(), 0);

    h.handle.recover().await.unwrap();
    for expected in &ids {
        let result = next_result(&h.updates).await;
        assert_eq!(&result.test_id, expected);
        assert!(result.is_passing);
    }
    assert_eq!(spy.order(), vec!["a", "b", "c"]);

    let status = h.handle.status().await.unwrap();
    assert_eq!(status.state, OrchestratorState::Idle);
    assert!(status.fatal_error.is_none());
}

#[tokio::test]
async fn test_recover_while_idle_is_noop() {
    init_tracing();
    let h = spawn(OrchestratorConfig::default()).await;

    h.handle.recover().await.unwrap();
    h.handle.recover().await.unwrap();
    let status = h.handle.status().await.unwrap();

    assert_eq!(status.state, OrchestratorState::Idle);
    // 既没有状态广播也没有结果
    assert!(h.updates.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_full_queue_rejects_start() {
    init_tracing();
    let h = spawn(OrchestratorConfig {
        max_queue_length: Some(1),
        ..Default::default()
    })
    .await;
    let spy = Spy::default();

    h.handle.start(StartSignal::new(sleeper())).await.unwrap();
    wait_first_step(&h.updates).await;
    h.handle.start(StartSignal::new(spy.sequence("queued"))).await.unwrap();
    let rejected = h.handle.start(StartSignal::new(spy.sequence("overflow"))).await.unwrap();

    let result = next_result(&h.updates).await;
    assert_eq!(result.test_id, rejected);
    assert!(!result.is_passing);
    assert!(matches!(result.test_errors[0], TestError::Rejected { .. }));

    let status = h.handle.status().await.unwrap();
    assert_eq!(status.queue_length, 1);
}

#[tokio::test]
async fn test_accumulator_receives_report() {
    init_tracing();
    let accumulator = Arc::new(MemoryAccumulator::new());
    let (orchestrator, handle) = Orchestrator::new(Sequencer::new(), OrchestratorConfig::default());
    let orchestrator = orchestrator.with_accumulator(accumulator.clone());
    let h = spawn_with(orchestrator, handle).await;

    let test_id = h
        .handle
        .start(
            StartSignal::new(Sequence::new("noop", "").with_step(NoopStep::new()))
                .with_metadata("bench", "hil-1"),
        )
        .await
        .unwrap();
    next_result(&h.updates).await;

    // 退出前等待所有记录任务写完
    h.handle.shutdown().await.unwrap();
    h.task.await.unwrap();

    let report = accumulator.find(test_id).await.expect("汇总器未收到报告");
    assert_eq!(report.sequence_name, "noop");
    assert!(report.is_passing);
    assert_eq!(report.metadata.get("bench").map(String::as_str), Some("hil-1"));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_waits_for_current_result() {
    init_tracing();
    let h = spawn(OrchestratorConfig::default()).await;
    let spy = Spy::default();

    let running = h.handle.start(StartSignal::new(sleeper())).await.unwrap();
    let queued = h.handle.start(StartSignal::new(spy.sequence("queued"))).await.unwrap();
    wait_first_step(&h.updates).await;

    h.handle.shutdown().await.unwrap();

    let first = next_result(&h.updates).await;
    let second = next_result(&h.updates).await;
    assert_eq!(first.test_id, queued);
    assert_eq!(second.test_id, running);
    assert!(first.cancelled && second.cancelled);

    timeout(Duration::from_secs(30), h.task)
        .await
        .expect("编排器未退出")
        .unwrap();
    assert_eq!(spy.runs(), 0);
}

#[tokio::test]
async fn test_failing_tags_reported_in_result() {
    init_tracing();
    let h = spawn(OrchestratorConfig::default()).await;
    let tag = Tag::new("FW001", "front controller flashed");

    let seq = Sequence::new("tags", "")
        .with_step(NoopStep::new().with_result(tag.clone(), false))
        .with_step(NoopStep::new());
    h.handle.start(StartSignal::new(seq)).await.unwrap();

    let result = next_result(&h.updates).await;
    assert!(!result.is_passing);
    assert_eq!(result.failed_tags, vec![tag]);
}

#[tokio::test]
async fn test_queue_is_unbounded_by_default() {
    init_tracing();
    let h = spawn(OrchestratorConfig::default()).await;
    let spy = Spy::default();

    h.handle.start(StartSignal::new(fatal())).await.unwrap();
    next_result(&h.updates).await;

    for i in 0..12 {
        h.handle
            .start(StartSignal::new(spy.sequence(&format!("s{}", i))))
            .await
            .unwrap();
    }

    let status = h.handle.status().await.unwrap();
    assert_eq!(status.state, OrchestratorState::FatalError);
    assert_eq!(status.queue_length, 12);

    // 没有任何请求被拒绝
    while let Ok(update) = h.updates.try_recv() {
        assert!(!matches!(update, CoreUpdate::Result(_)), "unexpected result");
    }
    assert_eq!(spy.runs(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_timeout_still_reports_result() {
    init_tracing();
    let h = spawn(OrchestratorConfig {
        shutdown_timeout_secs: 1,
        ..Default::default()
    })
    .await;

    let test_id = h
        .handle
        .start(StartSignal::new(
            Sequence::new("stubborn", "").with_step(StubbornStep),
        ))
        .await
        .unwrap();
    wait_first_step(&h.updates).await;

    let started = tokio::time::Instant::now();
    h.handle.shutdown().await.unwrap();

    let result = next_result(&h.updates).await;
    assert_eq!(result.test_id, test_id);
    assert!(result.cancelled);
    assert!(!result.is_passing);
    assert!(result
        .test_errors
        .iter()
        .any(|e| matches!(e, TestError::RunnerAborted { .. })));

    timeout(Duration::from_secs(30), h.task)
        .await
        .expect("编排器未退出")
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(60));
}
