//! 前端网关
//!
//! 每个接入的前端对应两个转发任务：
//! - 入站：前端信号 -> 编排器事件队列
//! - 出站：编排器广播 -> 前端更新通道

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;
use crate::orchestrator::OrchestratorHandle;
use crate::Result;

/// 前端网关
pub struct Gateway {
    name: String,
    cancel: CancellationToken,
    inbound: JoinHandle<()>,
    outbound: JoinHandle<()>,
}

impl Gateway {
    /// 接入一个前端并启动转发任务
    ///
    /// 订阅先于任何入站信号进入编排器队列，前端不会错过自己请求的结果。
    pub async fn attach(
        dispatcher: &dyn Dispatcher,
        core: OrchestratorHandle,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let name = dispatcher.name().to_string();
        let updates_rx = core.subscribe().await?;
        let signals = dispatcher.signals();
        let updates = dispatcher.updates();

        info!("接入前端: {}", name);

        let inbound = {
            let name = name.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let signal = tokio::select! {
                        _ = cancel.cancelled() => break,
                        signal = signals.recv() => signal,
                    };
                    let Ok(signal) = signal else {
                        debug!("前端 {} 信号通道已关闭", name);
                        break;
                    };
                    if let Err(e) = core.send(signal).await {
                        warn!("前端 {} 信号转发失败: {}", name, e);
                        break;
                    }
                }
                debug!("前端 {} 入站转发结束", name);
            })
        };

        let outbound = {
            let name = name.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let update = tokio::select! {
                        _ = cancel.cancelled() => break,
                        update = updates_rx.recv() => update,
                    };
                    // 编排器退出时关闭订阅通道，剩余更新仍会先被取完
                    let Ok(update) = update else {
                        break;
                    };
                    if updates.send(update).await.is_err() {
                        debug!("前端 {} 更新通道已关闭", name);
                        break;
                    }
                }
                debug!("前端 {} 出站转发结束", name);
            })
        };

        Ok(Self {
            name,
            cancel,
            inbound,
            outbound,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 编排器退出后调用：停止入站转发，等待出站转发把剩余更新送达前端
    pub async fn drain(self) {
        self.inbound.abort();
        let _ = self.inbound.await;
        let _ = self.outbound.await;
        info!("前端 {} 已断开", self.name);
    }

    /// 立即停止两个转发任务
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.inbound.await;
        let _ = self.outbound.await;
        info!("前端 {} 已断开", self.name);
    }
}
