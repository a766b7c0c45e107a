//! 认知层：Planner、Prompt、ReAct 单任务状态机与 Worker 通知

pub mod events;
pub mod loop_;
pub mod planner;
pub mod prompt;

pub use events::{Notifier, ProgressEvent, WorkerEvent};
pub use loop_::{DecisionGate, Stopped, TaskRun};
pub use planner::{parse_step, PlanError, Planner, StepPlan};
