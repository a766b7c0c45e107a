//! 状态定义：Worker 阶段、任务终态、可持久化快照

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::memory::AgentMemory;

/// 强制收尾后仍未给出最终答案时的失败原因
pub const NO_FINAL_ANSWER: &str = "agent did not provide final answer";

/// Worker 在一个任务内所处的阶段
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum WorkerPhase {
    Idle,
    Running { step: usize },
    AwaitingValidation { step: usize },
    /// 已到步数上限，最后一次模型调用（不经校验）
    ForcingFinal,
    Completed,
    Failed,
    Rejected,
}

impl WorkerPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkerPhase::Completed | WorkerPhase::Failed | WorkerPhase::Rejected
        )
    }
}

impl fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerPhase::Idle => write!(f, "idle"),
            WorkerPhase::Running { step } => write!(f, "running(step={step})"),
            WorkerPhase::AwaitingValidation { step } => write!(f, "awaiting_validation(step={step})"),
            WorkerPhase::ForcingFinal => write!(f, "forcing_final"),
            WorkerPhase::Completed => write!(f, "completed"),
            WorkerPhase::Failed => write!(f, "failed"),
            WorkerPhase::Rejected => write!(f, "rejected"),
        }
    }
}

/// 一个任务的终态；每个终态恰好产生一次通知
#[derive(Clone, Debug, PartialEq)]
pub enum TaskOutcome {
    Completed(String),
    Failed(String),
    Rejected,
}

impl TaskOutcome {
    pub fn phase(&self) -> WorkerPhase {
        match self {
            TaskOutcome::Completed(_) => WorkerPhase::Completed,
            TaskOutcome::Failed(_) => WorkerPhase::Failed,
            TaskOutcome::Rejected => WorkerPhase::Rejected,
        }
    }
}

/// 随 finalResult 一起返回的可持久化状态：步骤日志与用户变量
///
/// 主 Worker 意外退出后，Orchestrator 用它重建下一个 Worker，多轮上下文不丢。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WorkerSnapshot {
    pub memory: AgentMemory,
    pub variables: BTreeMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_phases() {
        assert!(TaskOutcome::Rejected.phase().is_terminal());
        assert!(TaskOutcome::Completed("x".into()).phase().is_terminal());
        assert!(!WorkerPhase::ForcingFinal.is_terminal());
        assert_eq!(WorkerPhase::Running { step: 2 }.to_string(), "running(step=2)");
    }
}
