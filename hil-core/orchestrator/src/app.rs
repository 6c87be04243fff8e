//! 应用生命周期：打开前端、运行编排器、关闭前端

use hil_flow::{ResultsAccumulator, Sequencer};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::OrchestratorConfig;
use crate::dispatcher::Dispatcher;
use crate::gateway::Gateway;
use crate::orchestrator::{Orchestrator, OrchestratorHandle};
use crate::{OrchestratorError, Result};

/// HIL 应用
pub struct HilApp {
    orchestrator: Orchestrator,
    handle: OrchestratorHandle,
    dispatchers: Vec<Box<dyn Dispatcher>>,
}

impl HilApp {
    pub fn new(sequencer: Sequencer, config: OrchestratorConfig) -> Result<Self> {
        config.validate()?;
        let (orchestrator, handle) = Orchestrator::new(sequencer, config);
        Ok(Self {
            orchestrator,
            handle,
            dispatchers: Vec::new(),
        })
    }

    pub fn with_accumulator(mut self, accumulator: Arc<dyn ResultsAccumulator>) -> Self {
        self.orchestrator = self.orchestrator.with_accumulator(accumulator);
        self
    }

    /// 添加前端
    pub fn add_dispatcher(&mut self, dispatcher: impl Dispatcher + 'static) {
        self.dispatchers.push(Box::new(dispatcher));
    }

    /// 编排器句柄 (用于进程内直接提交请求)
    pub fn handle(&self) -> OrchestratorHandle {
        self.handle.clone()
    }

    /// 运行直到收到关闭信号或令牌被取消
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let Self {
            orchestrator,
            handle,
            mut dispatchers,
        } = self;

        for index in 0..dispatchers.len() {
            let dispatcher = &mut dispatchers[index];
            info!("打开前端: {}", dispatcher.name());
            if let Err(e) = dispatcher.open(&cancel).await {
                let err = OrchestratorError::DispatcherOpen {
                    name: dispatcher.name().to_string(),
                    message: format!("{:#}", e),
                };
                error!("{}", err);
                // 只关闭已经打开的前端
                let _ = close_all(&mut dispatchers[..index]).await;
                return Err(err);
            }
        }

        let relay_cancel = cancel.child_token();
        let mut gateways = Vec::with_capacity(dispatchers.len());
        for dispatcher in &dispatchers {
            match Gateway::attach(dispatcher.as_ref(), handle.clone(), relay_cancel.clone()).await {
                Ok(gateway) => gateways.push(gateway),
                Err(e) => {
                    for gateway in gateways {
                        gateway.stop().await;
                    }
                    let _ = close_all(&mut dispatchers).await;
                    return Err(e);
                }
            }
        }

        orchestrator.run(cancel.child_token()).await;

        for gateway in gateways {
            gateway.drain().await;
        }

        close_all(&mut dispatchers).await
    }
}

/// 关闭所有前端，收集错误但不中断关闭过程
async fn close_all(dispatchers: &mut [Box<dyn Dispatcher>]) -> Result<()> {
    let mut errors = Vec::new();
    for dispatcher in dispatchers.iter_mut() {
        info!("关闭前端: {}", dispatcher.name());
        if let Err(e) = dispatcher.close().await {
            error!("前端 {} 关闭失败: {:#}", dispatcher.name(), e);
            errors.push(format!("{}: {:#}", dispatcher.name(), e));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(OrchestratorError::DispatcherClose(errors.join("; ")))
    }
}
