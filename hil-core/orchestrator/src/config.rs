//! 编排器配置

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{OrchestratorError, Result};

/// 编排器配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// 等待队列最大长度，未设置时不限制；超过时新的测试请求直接被拒绝
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_queue_length: Option<usize>,

    /// 关闭时等待当前运行结束的时长 (秒)
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_queue_length: None,
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl OrchestratorConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// 验证配置
    pub fn validate(&self) -> Result<()> {
        if self.max_queue_length == Some(0) {
            return Err(OrchestratorError::Config(
                "max_queue_length 必须大于 0".to_string(),
            ));
        }
        Ok(())
    }
}
