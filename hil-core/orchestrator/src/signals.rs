//! 前端与编排器之间传递的信号

use hil_flow::{Progress, Sequence, Tag, TestError, TestId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::state::OrchestratorState;

/// 测试请求
#[derive(Debug)]
pub struct StartSignal {
    pub test_id: TestId,
    pub sequence: Sequence,
    pub metadata: HashMap<String, String>,
}

impl StartSignal {
    /// 创建测试请求并生成新的 test_id
    pub fn new(sequence: Sequence) -> Self {
        Self {
            test_id: Uuid::new_v4(),
            sequence,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

/// 取消请求
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelSignal {
    pub test_id: TestId,
}

/// 从致命错误状态恢复
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecoverSignal;

/// 请求整个编排器退出
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ShutdownSignal;

/// 前端发往编排器的信号
///
/// 同一前端的所有信号走同一条有序通道，保证跨信号类型的 FIFO。
#[derive(Debug)]
pub enum DispatcherSignal {
    Start(StartSignal),
    Cancel(CancelSignal),
    Recover(RecoverSignal),
    Shutdown(ShutdownSignal),
}

/// 状态快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSignal {
    pub state: OrchestratorState,
    pub test_id: Option<TestId>,
    pub fatal_error: Option<String>,
    pub progress: Option<Progress>,
    pub queue_length: usize,
}

/// 运行结果，每个被接受的测试请求恰好对应一个
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSignal {
    pub test_id: TestId,
    pub sequence_name: String,
    pub is_passing: bool,
    pub cancelled: bool,
    pub failed_tags: Vec<Tag>,
    pub test_errors: Vec<TestError>,
}

impl ResultSignal {
    /// 排队中被取消的运行
    pub fn cancelled_in_queue(test_id: TestId, sequence_name: &str) -> Self {
        Self {
            test_id,
            sequence_name: sequence_name.to_string(),
            is_passing: false,
            cancelled: true,
            failed_tags: Vec::new(),
            test_errors: Vec::new(),
        }
    }

    /// 队列已满时被拒绝的运行
    pub fn rejected(test_id: TestId, sequence_name: &str, reason: &str) -> Self {
        Self {
            test_id,
            sequence_name: sequence_name.to_string(),
            is_passing: false,
            cancelled: false,
            failed_tags: Vec::new(),
            test_errors: vec![TestError::Rejected {
                reason: reason.to_string(),
            }],
        }
    }
}

/// 编排器广播给前端的更新
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum CoreUpdate {
    Status(StatusSignal),
    Result(ResultSignal),
}
