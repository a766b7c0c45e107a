//! Worker -> 监听者（Orchestrator）的通知
//!
//! WorkerEvent 是跨 Worker/Orchestrator 边界的唯一消息；ProgressEvent 是它的可序列化投影，
//! 由 Orchestrator 广播给订阅者（UI / 日志），也承载 Worker 自己发出的过程信息。

use serde::Serialize;

use crate::core::state::{TaskOutcome, WorkerSnapshot};
use crate::core::supervisor::WorkerId;
use crate::core::validation::Decision;

/// 预览文本的最大字符数
const PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Started {
        worker: WorkerId,
        agent: String,
    },
    /// 等待校验；同一 Worker 同一时刻至多一个
    PendingValidation {
        worker: WorkerId,
        agent: String,
        step: usize,
        thought: String,
        code: String,
    },
    FinalResult {
        worker: WorkerId,
        answer: String,
        snapshot: WorkerSnapshot,
    },
    Error {
        worker: WorkerId,
        reason: String,
        snapshot: WorkerSnapshot,
    },
    Rejected {
        worker: WorkerId,
        snapshot: WorkerSnapshot,
    },
    Progress(ProgressEvent),
    /// 由 Supervisor 的监视任务发出；reason 为 None 表示正常退出
    Exited {
        worker: WorkerId,
        reason: Option<String>,
    },
}

impl WorkerEvent {
    /// 广播给订阅者的投影
    pub fn to_progress(&self) -> ProgressEvent {
        match self {
            WorkerEvent::Started { worker, agent } => ProgressEvent::Started {
                worker: worker.to_string(),
                agent: agent.clone(),
            },
            WorkerEvent::PendingValidation {
                worker,
                agent,
                step,
                thought,
                code,
            } => ProgressEvent::PendingValidation {
                worker: worker.to_string(),
                agent: agent.clone(),
                step: *step,
                thought: thought.clone(),
                code: code.clone(),
            },
            WorkerEvent::FinalResult { worker, answer, .. } => ProgressEvent::FinalResult {
                worker: worker.to_string(),
                answer: answer.clone(),
            },
            WorkerEvent::Error { worker, reason, .. } => ProgressEvent::Error {
                worker: worker.to_string(),
                reason: reason.clone(),
            },
            WorkerEvent::Rejected { worker, .. } => ProgressEvent::Rejected {
                worker: worker.to_string(),
            },
            WorkerEvent::Progress(event) => event.clone(),
            WorkerEvent::Exited { worker, reason } => ProgressEvent::Exited {
                worker: worker.to_string(),
                reason: reason.clone(),
            },
        }
    }
}

/// 过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started {
        worker: String,
        agent: String,
    },
    /// 进入第几步
    StepUpdate {
        worker: String,
        agent: String,
        step: usize,
        max_steps: usize,
    },
    PendingValidation {
        worker: String,
        agent: String,
        step: usize,
        thought: String,
        code: String,
    },
    Decision {
        worker: String,
        step: usize,
        decision: String,
    },
    /// 代码执行结果（预览）
    Observation {
        worker: String,
        step: usize,
        ok: bool,
        preview: String,
    },
    /// 到达步数上限，强制收尾
    ForcingFinal {
        worker: String,
        agent: String,
    },
    FinalResult {
        worker: String,
        answer: String,
    },
    Error {
        worker: String,
        reason: String,
    },
    Rejected {
        worker: String,
    },
    Exited {
        worker: String,
        reason: Option<String>,
    },
}

/// Worker 侧的通知发送器；监听者已关闭时静默丢弃
#[derive(Debug, Clone)]
pub struct Notifier {
    worker: WorkerId,
    agent: String,
    tx: tokio::sync::mpsc::UnboundedSender<WorkerEvent>,
}

impl Notifier {
    pub fn new(
        worker: WorkerId,
        agent: impl Into<String>,
        tx: tokio::sync::mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        Self {
            worker,
            agent: agent.into(),
            tx,
        }
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    fn send(&self, event: WorkerEvent) {
        let _ = self.tx.send(event);
    }

    pub fn started(&self) {
        self.send(WorkerEvent::Started {
            worker: self.worker,
            agent: self.agent.clone(),
        });
    }

    pub fn pending_validation(&self, step: usize, thought: &str, code: &str) {
        self.send(WorkerEvent::PendingValidation {
            worker: self.worker,
            agent: self.agent.clone(),
            step,
            thought: thought.to_string(),
            code: code.to_string(),
        });
    }

    pub fn step_update(&self, step: usize, max_steps: usize) {
        self.send(WorkerEvent::Progress(ProgressEvent::StepUpdate {
            worker: self.worker.to_string(),
            agent: self.agent.clone(),
            step,
            max_steps,
        }));
    }

    pub fn decision(&self, step: usize, decision: &Decision) {
        self.send(WorkerEvent::Progress(ProgressEvent::Decision {
            worker: self.worker.to_string(),
            step,
            decision: decision.label().to_string(),
        }));
    }

    pub fn observation(&self, step: usize, ok: bool, text: &str) {
        self.send(WorkerEvent::Progress(ProgressEvent::Observation {
            worker: self.worker.to_string(),
            step,
            ok,
            preview: preview(text),
        }));
    }

    pub fn forcing_final(&self) {
        self.send(WorkerEvent::Progress(ProgressEvent::ForcingFinal {
            worker: self.worker.to_string(),
            agent: self.agent.clone(),
        }));
    }

    /// 终态通知：每个任务恰好一次
    pub fn outcome(&self, outcome: TaskOutcome, snapshot: WorkerSnapshot) {
        let event = match outcome {
            TaskOutcome::Completed(answer) => WorkerEvent::FinalResult {
                worker: self.worker,
                answer,
                snapshot,
            },
            TaskOutcome::Failed(reason) => WorkerEvent::Error {
                worker: self.worker,
                reason,
                snapshot,
            },
            TaskOutcome::Rejected => WorkerEvent::Rejected {
                worker: self.worker,
                snapshot,
            },
        };
        self.send(event);
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() > PREVIEW_CHARS {
        let head: String = text.chars().take(PREVIEW_CHARS).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_serializes_with_type_tag() {
        let event = ProgressEvent::Decision {
            worker: "abc".to_string(),
            step: 2,
            decision: "approve".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "decision");
        assert_eq!(json["step"], 2);
    }

    #[test]
    fn test_notifier_outcome_maps_to_event() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let id = WorkerId::new();
        let notifier = Notifier::new(id, "main", tx);
        notifier.outcome(TaskOutcome::Rejected, WorkerSnapshot::default());
        notifier.observation(1, true, &"x".repeat(500));
        match rx.try_recv().unwrap() {
            WorkerEvent::Rejected { worker, .. } => assert_eq!(worker, id),
            other => panic!("unexpected {:?}", other),
        }
        match rx.try_recv().unwrap().to_progress() {
            ProgressEvent::Observation { preview, .. } => assert_eq!(preview.len(), PREVIEW_CHARS + 3),
            other => panic!("unexpected {:?}", other),
        }
    }
}
