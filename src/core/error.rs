//! 编排层错误类型
//!
//! run_task 的调用方只会看到 AgentError；代码执行故障、解析失败都在 Worker 内部被记录为步骤错误，不会出现在这里。

use std::time::Duration;

use thiserror::Error;

/// run_task / submit_decision / stop 可能返回的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// 校验关卡拒绝执行（主动停止，不算故障）
    #[error("Task rejected by validation")]
    Rejected,

    #[error("Task failed: {0}")]
    TaskFailed(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Worker 未发出终态通知就退出（panic 或被停止）
    #[error("Worker exited unexpectedly: {0}")]
    WorkerExited(String),

    #[error("Failed to start worker: {0}")]
    StartFailed(String),

    /// 已有任务在执行
    #[error("Another task is already running")]
    Busy,

    #[error("Orchestrator stopped")]
    OrchestratorStopped,
}

impl AgentError {
    pub fn is_rejection(&self) -> bool {
        matches!(self, AgentError::Rejected)
    }
}
