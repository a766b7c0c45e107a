//! 核心编排层：错误、状态、Worker 监管、Worker actor、校验关卡、Orchestrator 主控循环

pub mod error;
pub mod orchestrator;
pub mod state;
pub mod supervisor;
pub mod validation;
pub mod worker;

pub use crate::agent::AgentConfig;
pub use error::AgentError;
pub use orchestrator::{Orchestrator, OrchestratorHandle, OrchestratorSettings, WeakOrchestrator};
pub use state::{TaskOutcome, WorkerPhase, WorkerSnapshot, NO_FINAL_ANSWER};
pub use supervisor::{SupervisorError, WorkerCommand, WorkerHandle, WorkerId, WorkerInfo, WorkerSupervisor};
pub use validation::{
    handler_from_config, AiJudgeHandler, AutoApproveHandler, ChannelHandler, Decision, DecisionReply,
    InteractiveHandler, JudgeDecision, JudgeVerdict, ValidationHandler, ValidationMode, ValidationRequest,
};
pub use worker::{Worker, WorkerContext};
