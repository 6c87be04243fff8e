//! 前端契约

use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::signals::{CoreUpdate, DispatcherSignal};

/// 前端 (命令行、HTTP 等)
///
/// 前端通过 `signals()` 发出测试请求、取消、恢复和关闭信号，
/// 通过 `updates()` 接收编排器广播的状态和结果。
/// 编排器不关心前端如何呈现这些信息。
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// 前端名称
    fn name(&self) -> &str;

    /// 打开前端 (开始接受用户输入)
    async fn open(&mut self, cancel: &CancellationToken) -> anyhow::Result<()>;

    /// 关闭前端并释放资源
    async fn close(&mut self) -> anyhow::Result<()>;

    /// 前端发往编排器的信号流
    fn signals(&self) -> Receiver<DispatcherSignal>;

    /// 编排器更新的接收端
    fn updates(&self) -> Sender<CoreUpdate>;
}
