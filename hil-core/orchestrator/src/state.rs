use serde::{Deserialize, Serialize};
use std::fmt;

/// 编排器状态
///
/// 只有在 `Idle` 时才会从队列取出新的运行；`FatalError` 时队列冻结，
/// 直到收到恢复信号。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    #[default]
    Idle,
    Running,
    FatalError,
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrchestratorState::Idle => "idle",
            OrchestratorState::Running => "running",
            OrchestratorState::FatalError => "fatal_error",
        };
        f.write_str(s)
    }
}
