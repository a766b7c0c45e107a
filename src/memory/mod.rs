//! 记忆层：对话消息类型与 Worker 的步骤日志（只追加）

pub mod steps;
pub mod transcript;

pub use steps::{ActionStep, AgentMemory, Step, StepOutcome};
pub use transcript::{Message, Role};
