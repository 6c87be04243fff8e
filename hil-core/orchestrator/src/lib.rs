//! HIL 测试编排器
//!
//! 接收前端的测试请求，按 FIFO 排队并逐个交给序列执行器运行，
//! 把状态和结果广播给所有已接入的前端。

pub mod app;
pub mod config;
pub mod dispatcher;
pub mod gateway;
pub mod orchestrator;
pub mod signals;
pub mod state;

pub use app::HilApp;
pub use config::OrchestratorConfig;
pub use dispatcher::Dispatcher;
pub use gateway::Gateway;
pub use orchestrator::{Orchestrator, OrchestratorHandle};
pub use signals::{
    CancelSignal, CoreUpdate, DispatcherSignal, RecoverSignal, ResultSignal, ShutdownSignal,
    StartSignal, StatusSignal,
};
pub use state::OrchestratorState;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("编排器通道已关闭: {0}")]
    ChannelClosed(String),

    #[error("前端 {name} 打开失败: {message}")]
    DispatcherOpen { name: String, message: String },

    #[error("前端关闭失败: {0}")]
    DispatcherClose(String),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("流程错误: {0}")]
    Flow(#[from] hil_flow::FlowError),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
