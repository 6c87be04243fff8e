//! 编排器核心
//!
//! 单一所有者的事件循环 (actor)：状态、运行队列和当前进度只由循环本身修改，
//! 其他组件通过 [`OrchestratorHandle`] 发送事件、通过订阅接收快照。

use async_channel::{Receiver, Sender};
use chrono::{DateTime, Utc};
use hil_flow::{
    Progress, ResultsAccumulator, RunReport, SequenceInfo, SequenceOutcome, Sequencer, TestError,
    TestId,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::OrchestratorConfig;
use crate::signals::{
    CancelSignal, CoreUpdate, DispatcherSignal, RecoverSignal, ResultSignal, ShutdownSignal,
    StartSignal, StatusSignal,
};
use crate::state::OrchestratorState;
use crate::{OrchestratorError, Result};

/// 发往编排器的事件
enum CoreEvent {
    Signal(DispatcherSignal),
    Subscribe(Sender<CoreUpdate>),
    QueryStatus(oneshot::Sender<StatusSignal>),
}

/// 运行任务回报的事件
enum RunnerEvent {
    Progress {
        test_id: TestId,
        progress: Progress,
    },
    Completed {
        test_id: TestId,
        outcome: SequenceOutcome,
    },
}

/// 事件循环单次迭代取到的事件
enum Next {
    Stop,
    Event(Option<CoreEvent>),
    Runner(Option<RunnerEvent>),
}

/// 正在执行的运行
struct CurrentRun {
    test_id: TestId,
    sequence_name: String,
    metadata: HashMap<String, String>,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
}

/// 编排器核心
pub struct Orchestrator {
    sequencer: Sequencer,
    config: OrchestratorConfig,
    accumulator: Option<Arc<dyn ResultsAccumulator>>,

    /// 来自句柄的事件
    events_rx: Receiver<CoreEvent>,

    /// 来自运行任务的进度与完成事件
    runner_tx: Sender<RunnerEvent>,
    runner_rx: Receiver<RunnerEvent>,

    state: OrchestratorState,
    queue: VecDeque<StartSignal>,
    current: Option<CurrentRun>,
    fatal_error: Option<String>,
    progress: Option<Progress>,
    subscribers: Vec<Sender<CoreUpdate>>,
    /// 尚未完成的结果记录任务，退出前全部等待
    pending_records: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
    shutting_down: bool,
}

impl Orchestrator {
    /// 创建编排器及其句柄
    pub fn new(sequencer: Sequencer, config: OrchestratorConfig) -> (Self, OrchestratorHandle) {
        let (events_tx, events_rx) = async_channel::unbounded();
        let (runner_tx, runner_rx) = async_channel::unbounded();

        let orchestrator = Self {
            sequencer,
            config,
            accumulator: None,
            events_rx,
            runner_tx,
            runner_rx,
            state: OrchestratorState::Idle,
            queue: VecDeque::new(),
            current: None,
            fatal_error: None,
            progress: None,
            subscribers: Vec::new(),
            pending_records: Vec::new(),
            cancel: CancellationToken::new(),
            shutting_down: false,
        };

        (orchestrator, OrchestratorHandle { events_tx })
    }

    /// 设置结果汇总器
    pub fn with_accumulator(mut self, accumulator: Arc<dyn ResultsAccumulator>) -> Self {
        self.accumulator = Some(accumulator);
        self
    }

    /// 启动事件循环，直到收到关闭信号或令牌被取消
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            "编排器启动 (队列上限: {:?}, 关闭等待: {:?})",
            self.config.max_queue_length,
            self.config.shutdown_timeout()
        );
        self.cancel = cancel;

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => Next::Stop,
                event = self.events_rx.recv() => Next::Event(event.ok()),
                event = self.runner_rx.recv() => Next::Runner(event.ok()),
            };

            match next {
                Next::Stop => {
                    info!("编排器令牌已取消，准备退出");
                    break;
                }
                Next::Event(None) => {
                    info!("编排器事件通道已关闭，准备退出");
                    break;
                }
                Next::Event(Some(CoreEvent::Signal(DispatcherSignal::Shutdown(ShutdownSignal)))) => {
                    info!("收到关闭信号，准备退出");
                    break;
                }
                Next::Event(Some(event)) => self.handle_event(event),
                Next::Runner(Some(event)) => self.handle_runner_event(event),
                Next::Runner(None) => {}
            }
        }

        self.shutdown().await;
        info!("编排器已退出");
    }

    fn handle_event(&mut self, event: CoreEvent) {
        match event {
            CoreEvent::Signal(DispatcherSignal::Start(signal)) => self.on_start(signal),
            CoreEvent::Signal(DispatcherSignal::Cancel(signal)) => self.on_cancel(signal),
            CoreEvent::Signal(DispatcherSignal::Recover(RecoverSignal)) => self.on_recover(),
            CoreEvent::Signal(DispatcherSignal::Shutdown(_)) => {
                // 在事件循环中处理
            }
            CoreEvent::Subscribe(tx) => {
                debug!("新增订阅者 (当前: {})", self.subscribers.len() + 1);
                let _ = tx.try_send(CoreUpdate::Status(self.status()));
                self.subscribers.push(tx);
            }
            CoreEvent::QueryStatus(reply) => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn handle_runner_event(&mut self, event: RunnerEvent) {
        match event {
            RunnerEvent::Progress { test_id, progress } => match &self.current {
                Some(run) if run.test_id == test_id && !run.cancel.is_cancelled() => {
                    self.progress = Some(progress);
                    self.publish_status();
                }
                _ => debug!("忽略过期的进度更新 (test_id: {})", test_id),
            },
            RunnerEvent::Completed { test_id, outcome } => self.on_completed(test_id, outcome),
        }
    }

    fn on_start(&mut self, signal: StartSignal) {
        if let Some(limit) = self.config.max_queue_length.filter(|l| self.queue.len() >= *l) {
            warn!(
                "运行队列已满 ({}), 拒绝测试请求: {} (test_id: {})",
                self.queue.len(),
                signal.sequence.name,
                signal.test_id
            );
            let reason = format!("运行队列已满 (上限 {})", limit);
            self.broadcast(CoreUpdate::Result(ResultSignal::rejected(
                signal.test_id,
                &signal.sequence.name,
                &reason,
            )));
            return;
        }

        info!(
            "测试请求入队: {} (test_id: {}, 状态: {})",
            signal.sequence.name, signal.test_id, self.state
        );
        self.queue.push_back(signal);
        self.publish_status();
        self.start_next();
    }

    fn on_cancel(&mut self, signal: CancelSignal) {
        if let Some(run) = &self.current {
            if run.test_id == signal.test_id {
                info!("取消当前运行: {} (test_id: {})", run.sequence_name, run.test_id);
                run.cancel.cancel();
                return;
            }
        }

        let position = self.queue.iter().position(|s| s.test_id == signal.test_id);
        if let Some(removed) = position.and_then(|pos| self.queue.remove(pos)) {
            info!(
                "取消排队中的运行: {} (test_id: {})",
                removed.sequence.name, removed.test_id
            );
            self.broadcast(CoreUpdate::Result(ResultSignal::cancelled_in_queue(
                removed.test_id,
                &removed.sequence.name,
            )));
            self.publish_status();
            return;
        }

        warn!("取消请求对应的测试不存在: {}", signal.test_id);
    }

    fn on_recover(&mut self) {
        if self.state != OrchestratorState::FatalError {
            debug!("当前状态 {} 无需恢复，忽略恢复信号", self.state);
            return;
        }

        info!(
            "从致命错误状态恢复: {}",
            self.fatal_error.as_deref().unwrap_or_default()
        );
        self.fatal_error = None;
        self.state = OrchestratorState::Idle;
        self.publish_status();
        self.start_next();
    }

    fn on_completed(&mut self, test_id: TestId, outcome: SequenceOutcome) {
        let run = match self.current.take() {
            Some(run) if run.test_id == test_id => run,
            other => {
                warn!("收到未知运行的完成事件: {}", test_id);
                self.current = other;
                return;
            }
        };

        let result = ResultSignal {
            test_id,
            sequence_name: run.sequence_name.clone(),
            is_passing: outcome.is_passing(),
            cancelled: outcome.cancelled,
            failed_tags: outcome.failed_tags.clone(),
            test_errors: outcome.errors.clone(),
        };
        info!(
            "测试完成: {} (test_id: {}, 通过: {}, 取消: {})",
            result.sequence_name, test_id, result.is_passing, result.cancelled
        );
        self.broadcast(CoreUpdate::Result(result));
        self.record(&run, &outcome);

        self.progress = None;
        match outcome.fatal {
            Some(message) => {
                error!("进入致命错误状态，队列冻结: {}", message);
                self.fatal_error = Some(message);
                self.state = OrchestratorState::FatalError;
            }
            None => self.state = OrchestratorState::Idle,
        }
        self.publish_status();
        self.start_next();
    }

    /// 空闲时从队首取出下一个运行
    fn start_next(&mut self) {
        if self.shutting_down || self.state != OrchestratorState::Idle || self.current.is_some() {
            return;
        }
        let Some(signal) = self.queue.pop_front() else {
            return;
        };

        let StartSignal {
            test_id,
            mut sequence,
            metadata,
        } = signal;
        let run_cancel = self.cancel.child_token();

        info!("开始运行: {} (test_id: {})", sequence.name, test_id);
        self.progress = Some(Progress::new(SequenceInfo::of(&sequence)));
        self.current = Some(CurrentRun {
            test_id,
            sequence_name: sequence.name.clone(),
            metadata,
            started_at: Utc::now(),
            cancel: run_cancel.clone(),
        });
        self.state = OrchestratorState::Running;
        self.publish_status();

        let sequencer = self.sequencer.clone();
        let progress_tx = self.runner_tx.clone();
        let runner = tokio::spawn(async move {
            let sink = move |progress: &Progress| {
                let _ = progress_tx.try_send(RunnerEvent::Progress {
                    test_id,
                    progress: progress.clone(),
                });
            };
            sequencer
                .run_sequence(test_id, &mut sequence, &run_cancel, &sink)
                .await
        });

        // 监督任务：运行任务本身异常退出时也要产生完成事件
        let completed_tx = self.runner_tx.clone();
        tokio::spawn(async move {
            let outcome = match runner.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("序列执行任务异常退出 (test_id: {}): {}", test_id, e);
                    SequenceOutcome {
                        errors: vec![TestError::RunnerAborted {
                            message: e.to_string(),
                        }],
                        ..Default::default()
                    }
                }
            };
            let _ = completed_tx
                .send(RunnerEvent::Completed { test_id, outcome })
                .await;
        });
    }

    /// 把完成的运行交给结果汇总器 (不阻塞事件循环)
    fn record(&mut self, run: &CurrentRun, outcome: &SequenceOutcome) {
        let Some(accumulator) = self.accumulator.clone() else {
            return;
        };
        let report = RunReport::from_outcome(
            run.test_id,
            &run.sequence_name,
            &run.metadata,
            run.started_at,
            outcome,
        );
        self.pending_records.retain(|task| !task.is_finished());
        self.pending_records.push(tokio::spawn(async move {
            if let Err(e) = accumulator.record_run(&report).await {
                error!("记录运行结果失败 (test_id: {}): {:#}", report.test_id, e);
            }
        }));
    }

    async fn shutdown(&mut self) {
        self.shutting_down = true;

        while let Some(signal) = self.queue.pop_front() {
            info!("编排器关闭，取消排队中的运行: {}", signal.test_id);
            self.broadcast(CoreUpdate::Result(ResultSignal::cancelled_in_queue(
                signal.test_id,
                &signal.sequence.name,
            )));
        }

        if let Some(run) = &self.current {
            info!("等待当前运行结束: {} (test_id: {})", run.sequence_name, run.test_id);
            run.cancel.cancel();

            let timeout = self.config.shutdown_timeout();
            let deadline = Instant::now() + timeout;
            while self.current.is_some() {
                let event = tokio::time::timeout_at(deadline, self.runner_rx.recv()).await;
                match event {
                    Ok(Ok(event)) => self.handle_runner_event(event),
                    Ok(Err(_)) => break,
                    Err(_) => {
                        warn!("等待当前运行结束超时 ({:?})", timeout);
                        break;
                    }
                }
            }
        }

        // 运行没有在期限内响应取消，仍然给前端一个结果
        if let Some(run) = &self.current {
            let test_id = run.test_id;
            let mut outcome = SequenceOutcome {
                cancelled: true,
                errors: vec![TestError::RunnerAborted {
                    message: format!("关闭时运行未在 {:?} 内结束", self.config.shutdown_timeout()),
                }],
                ..Default::default()
            };
            if let Some(progress) = &self.progress {
                outcome.step_passed = progress.step_passed.clone();
                outcome.step_duration = progress.step_duration.clone();
            }
            self.on_completed(test_id, outcome);
        }

        for task in self.pending_records.drain(..) {
            if let Err(e) = task.await {
                error!("结果记录任务异常退出: {}", e);
            }
        }

        self.publish_status();
    }

    fn status(&self) -> StatusSignal {
        StatusSignal {
            state: self.state,
            test_id: self.current.as_ref().map(|run| run.test_id),
            fatal_error: self.fatal_error.clone(),
            progress: self.progress.clone(),
            queue_length: self.queue.len(),
        }
    }

    fn publish_status(&mut self) {
        let status = self.status();
        self.broadcast(CoreUpdate::Status(status));
    }

    /// 发送给所有订阅者，移除已关闭的订阅者
    fn broadcast(&mut self, update: CoreUpdate) {
        self.subscribers.retain(|tx| match tx.try_send(update.clone()) {
            Ok(()) => true,
            Err(_) => {
                debug!("订阅者已关闭，移除");
                false
            }
        });
    }
}

/// 编排器句柄
#[derive(Clone)]
pub struct OrchestratorHandle {
    events_tx: Sender<CoreEvent>,
}

impl OrchestratorHandle {
    /// 发送前端信号
    pub async fn send(&self, signal: DispatcherSignal) -> Result<()> {
        self.events_tx
            .send(CoreEvent::Signal(signal))
            .await
            .map_err(|_| OrchestratorError::ChannelClosed("发送信号失败".to_string()))
    }

    /// 提交测试请求，返回 test_id
    pub async fn start(&self, signal: StartSignal) -> Result<TestId> {
        let test_id = signal.test_id;
        self.send(DispatcherSignal::Start(signal)).await?;
        Ok(test_id)
    }

    pub async fn cancel(&self, test_id: TestId) -> Result<()> {
        self.send(DispatcherSignal::Cancel(CancelSignal { test_id }))
            .await
    }

    pub async fn recover(&self) -> Result<()> {
        self.send(DispatcherSignal::Recover(RecoverSignal)).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(DispatcherSignal::Shutdown(ShutdownSignal)).await
    }

    /// 订阅状态与结果广播
    ///
    /// 订阅后首先收到一次当前状态。
    pub async fn subscribe(&self) -> Result<Receiver<CoreUpdate>> {
        let (tx, rx) = async_channel::unbounded();
        self.events_tx
            .send(CoreEvent::Subscribe(tx))
            .await
            .map_err(|_| OrchestratorError::ChannelClosed("订阅失败".to_string()))?;
        Ok(rx)
    }

    /// 查询当前状态
    pub async fn status(&self) -> Result<StatusSignal> {
        let (tx, rx) = oneshot::channel();
        self.events_tx
            .send(CoreEvent::QueryStatus(tx))
            .await
            .map_err(|_| OrchestratorError::ChannelClosed("查询状态失败".to_string()))?;
        rx.await
            .map_err(|_| OrchestratorError::ChannelClosed("状态应答丢失".to_string()))
    }
}
