//! 终端前端
//!
//! 启动时提交命令行请求的所有运行，用进度条显示当前运行，
//! 每个结果到达时打印结论，全部结果到齐后请求关闭。

use anyhow::{Context, Result};
use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use colored::Colorize;
use hil_flow::{CancellationToken, TestId};
use hil_orchestrator::{
    CancelSignal, CoreUpdate, Dispatcher, DispatcherSignal, OrchestratorState, RecoverSignal,
    ResultSignal, ShutdownSignal, StartSignal, StatusSignal,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 终端前端选项
#[derive(Debug, Clone, Default)]
pub struct ConsoleOptions {
    /// 以 JSON 行输出结果，不显示进度条
    pub json: bool,

    /// 进入致命错误状态时自动恢复
    pub auto_recover: bool,

    /// Ctrl-C 取消当前运行
    pub handle_ctrl_c: bool,
}

/// 终端前端
pub struct ConsoleDispatcher {
    requests: Vec<StartSignal>,
    options: ConsoleOptions,
    signals_tx: Sender<DispatcherSignal>,
    signals_rx: Receiver<DispatcherSignal>,
    updates_tx: Sender<CoreUpdate>,
    updates_rx: Receiver<CoreUpdate>,
    results: Arc<Mutex<Vec<ResultSignal>>>,
    render: Option<JoinHandle<()>>,
}

impl ConsoleDispatcher {
    pub fn new(requests: Vec<StartSignal>, options: ConsoleOptions) -> Self {
        let (signals_tx, signals_rx) = async_channel::unbounded();
        let (updates_tx, updates_rx) = async_channel::unbounded();

        Self {
            requests,
            options,
            signals_tx,
            signals_rx,
            updates_tx,
            updates_rx,
            results: Arc::new(Mutex::new(Vec::new())),
            render: None,
        }
    }

    /// 收到的结果 (按到达顺序)
    pub fn results(&self) -> Arc<Mutex<Vec<ResultSignal>>> {
        self.results.clone()
    }
}

#[async_trait]
impl Dispatcher for ConsoleDispatcher {
    fn name(&self) -> &str {
        "console"
    }

    async fn open(&mut self, cancel: &CancellationToken) -> Result<()> {
        let requests = std::mem::take(&mut self.requests);
        let submitted: HashSet<TestId> = requests.iter().map(|r| r.test_id).collect();
        let expected = submitted.len();

        for request in requests {
            if !self.options.json {
                println!(
                    "{} {} ({})",
                    "排队".bright_black(),
                    request.sequence.name.cyan(),
                    request.test_id.to_string().bright_black()
                );
            }
            self.signals_tx
                .send(DispatcherSignal::Start(request))
                .await
                .context("提交测试请求失败")?;
        }

        if expected == 0 {
            info!("没有需要运行的序列，直接退出");
            self.signals_tx
                .send(DispatcherSignal::Shutdown(ShutdownSignal))
                .await
                .context("发送关闭信号失败")?;
        }

        let renderer = Renderer {
            options: self.options.clone(),
            signals: self.signals_tx.clone(),
            results: self.results.clone(),
            submitted,
            expected,
            current: None,
            bar: None,
            recovering: false,
            shutdown_sent: expected == 0,
        };
        let updates = self.updates_rx.clone();
        let cancel = cancel.clone();
        self.render = Some(tokio::spawn(renderer.run(updates, cancel)));

        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        // 关闭更新通道，渲染任务取完剩余更新后退出
        self.updates_tx.close();
        if let Some(render) = self.render.take() {
            render.await.context("终端渲染任务异常退出")?;
        }
        Ok(())
    }

    fn signals(&self) -> Receiver<DispatcherSignal> {
        self.signals_rx.clone()
    }

    fn updates(&self) -> Sender<CoreUpdate> {
        self.updates_tx.clone()
    }
}

/// 渲染任务状态
struct Renderer {
    options: ConsoleOptions,
    signals: Sender<DispatcherSignal>,
    results: Arc<Mutex<Vec<ResultSignal>>>,
    /// 本前端提交的运行，其他前端的结果不计入
    submitted: HashSet<TestId>,
    expected: usize,
    current: Option<TestId>,
    bar: Option<(TestId, ProgressBar)>,
    recovering: bool,
    shutdown_sent: bool,
}

impl Renderer {
    async fn run(mut self, updates: Receiver<CoreUpdate>, cancel: CancellationToken) {
        loop {
            let update = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ctrl_c(self.options.handle_ctrl_c) => {
                    self.on_interrupt().await;
                    continue;
                }
                update = updates.recv() => update,
            };

            let Ok(update) = update else {
                break;
            };
            match update {
                CoreUpdate::Status(status) => self.on_status(status).await,
                CoreUpdate::Result(result) => self.on_result(result).await,
            }
        }

        if let Some((_, bar)) = self.bar.take() {
            bar.abandon();
        }
        debug!("终端渲染任务结束");
    }

    async fn on_status(&mut self, status: StatusSignal) {
        self.current = status.test_id;

        match status.state {
            OrchestratorState::FatalError => {
                if !self.recovering {
                    let message = status.fatal_error.as_deref().unwrap_or("unknown");
                    self.print_line(format!("{} {}", "致命错误:".red().bold(), message));

                    if self.options.auto_recover {
                        self.print_line("自动恢复并继续运行队列".yellow().to_string());
                        self.send(DispatcherSignal::Recover(RecoverSignal)).await;
                    } else {
                        self.print_line("队列已冻结，取消剩余运行并退出".yellow().to_string());
                        self.request_shutdown().await;
                    }
                    self.recovering = true;
                }
            }
            _ => self.recovering = false,
        }

        if self.options.json {
            return;
        }

        let (Some(test_id), Some(progress)) = (status.test_id, status.progress) else {
            return;
        };

        let needs_new_bar = !matches!(&self.bar, Some((id, _)) if *id == test_id);
        if needs_new_bar {
            if let Some((_, old)) = self.bar.take() {
                old.abandon();
            }
            self.bar = Some((test_id, new_bar(progress.total() as u64, &progress.sequence.name)));
        }

        if let Some((_, bar)) = &self.bar {
            bar.set_position(progress.completed() as u64);
            if let Some(step) = &progress.current_step {
                bar.set_message(format!("{} [{}]", progress.sequence.name, step.name));
            }
        }
    }

    async fn on_result(&mut self, result: ResultSignal) {
        if let Some((id, bar)) = self.bar.take() {
            if id == result.test_id {
                bar.finish_and_clear();
            } else {
                self.bar = Some((id, bar));
            }
        }

        if !self.submitted.contains(&result.test_id) {
            debug!("忽略其他前端的结果: {}", result.test_id);
            return;
        }

        if self.options.json {
            match serde_json::to_string(&result) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("结果序列化失败: {}", e),
            }
        } else {
            self.print_result(&result);
        }

        let received = {
            let mut results = self.results.lock().await;
            results.push(result);
            results.len()
        };

        if received >= self.expected {
            self.request_shutdown().await;
        }
    }

    async fn on_interrupt(&mut self) {
        match self.current {
            Some(test_id) => {
                self.print_line(format!("{} {}", "取消当前运行:".yellow(), test_id));
                self.send(DispatcherSignal::Cancel(CancelSignal { test_id })).await;
            }
            None => {
                self.print_line("没有正在运行的测试，退出".yellow().to_string());
                self.request_shutdown().await;
            }
        }
    }

    async fn request_shutdown(&mut self) {
        if self.shutdown_sent {
            return;
        }
        self.shutdown_sent = true;
        self.send(DispatcherSignal::Shutdown(ShutdownSignal)).await;
    }

    async fn send(&self, signal: DispatcherSignal) {
        if let Err(e) = self.signals.send(signal).await {
            warn!("信号发送失败: {}", e);
        }
    }

    fn print_line(&self, line: String) {
        if self.options.json {
            return;
        }
        match &self.bar {
            Some((_, bar)) => bar.println(line),
            None => println!("{}", line),
        }
    }

    fn print_result(&self, result: &ResultSignal) {
        let verdict = if result.cancelled {
            "⊘ CANCELLED".yellow().bold()
        } else if result.is_passing {
            "✓ PASS".green().bold()
        } else {
            "✗ FAIL".red().bold()
        };

        println!(
            "{} {} ({})",
            verdict,
            result.sequence_name.cyan(),
            result.test_id.to_string().bright_black()
        );

        for tag in &result.failed_tags {
            println!("    {} {}", "失败标签:".red(), tag);
        }
        for error in &result.test_errors {
            println!("    {} {}", "错误:".red(), error);
        }
    }
}

fn new_bar(len: u64, name: &str) -> ProgressBar {
    let bar = ProgressBar::new(len);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .map(|s| s.progress_chars("=>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    bar.set_style(style);
    bar.set_message(name.to_string());
    bar
}

/// 等待 Ctrl-C；未启用时永不完成
async fn ctrl_c(enabled: bool) {
    if !enabled {
        return std::future::pending().await;
    }
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hil_flow::{NoopStep, Sequence, Sequencer};
    use hil_orchestrator::{HilApp, OrchestratorConfig};

    fn request(name: &str) -> StartSignal {
        StartSignal::new(Sequence::new(name, "").with_step(NoopStep::new()))
    }

    #[tokio::test]
    async fn test_console_runs_all_requests_then_shuts_down() {
        let console = ConsoleDispatcher::new(
            vec![request("a"), request("b")],
            ConsoleOptions {
                json: true,
                ..Default::default()
            },
        );
        let results = console.results();

        let mut app = HilApp::new(Sequencer::new(), OrchestratorConfig::default()).unwrap();
        app.add_dispatcher(console);
        app.run(CancellationToken::new()).await.unwrap();

        let results = results.lock().await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].sequence_name, "a");
        assert!(results.iter().all(|r| r.is_passing));
    }

    /// 只提交请求、从不请求关闭的前端
    struct PassiveDispatcher {
        requests: Vec<StartSignal>,
        signals_tx: Sender<DispatcherSignal>,
        signals_rx: Receiver<DispatcherSignal>,
        updates_tx: Sender<CoreUpdate>,
        _updates_rx: Receiver<CoreUpdate>,
    }

    impl PassiveDispatcher {
        fn new(requests: Vec<StartSignal>) -> Self {
            let (signals_tx, signals_rx) = async_channel::unbounded();
            let (updates_tx, updates_rx) = async_channel::unbounded();
            Self {
                requests,
                signals_tx,
                signals_rx,
                updates_tx,
                _updates_rx: updates_rx,
            }
        }
    }

    #[async_trait]
    impl Dispatcher for PassiveDispatcher {
        fn name(&self) -> &str {
            "passive"
        }

        async fn open(&mut self, _cancel: &CancellationToken) -> Result<()> {
            for request in std::mem::take(&mut self.requests) {
                self.signals_tx.send(DispatcherSignal::Start(request)).await?;
            }
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }

        fn signals(&self) -> Receiver<DispatcherSignal> {
            self.signals_rx.clone()
        }

        fn updates(&self) -> Sender<CoreUpdate> {
            self.updates_tx.clone()
        }
    }

    #[tokio::test]
    async fn test_console_ignores_results_of_other_dispatchers() {
        let console = ConsoleDispatcher::new(
            vec![request("a"), request("b")],
            ConsoleOptions {
                json: true,
                ..Default::default()
            },
        );
        let results = console.results();

        let mut app = HilApp::new(Sequencer::new(), OrchestratorConfig::default()).unwrap();
        // 先接入的前端先入队，它的结果会先于终端的结果到达
        app.add_dispatcher(PassiveDispatcher::new(vec![request("x"), request("y")]));
        app.add_dispatcher(console);
        app.run(CancellationToken::new()).await.unwrap();

        let results = results.lock().await;
        let names: Vec<&str> = results.iter().map(|r| r.sequence_name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(results.iter().all(|r| r.is_passing && !r.cancelled));
    }

    #[tokio::test]
    async fn test_console_without_requests_exits() {
        let console = ConsoleDispatcher::new(Vec::new(), ConsoleOptions::default());
        let results = console.results();

        let mut app = HilApp::new(Sequencer::new(), OrchestratorConfig::default()).unwrap();
        app.add_dispatcher(console);
        app.run(CancellationToken::new()).await.unwrap();

        assert!(results.lock().await.is_empty());
    }
}
