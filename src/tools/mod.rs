//! 工具箱：Tool trait 与注册表、Echo 工具、子智能体工具

pub mod agent;
pub mod echo;
pub mod registry;

pub use agent::SubAgentTool;
pub use echo::EchoTool;
pub use registry::{Tool, ToolInput, ToolRegistry, FINAL_ANSWER_TOOL};
