//! Hive - 代码执行型智能体编排引擎
//!
//! 模块划分：
//! - **agent**: 智能体配置（名称、指令、工具、子智能体、模型、步数上限）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: Orchestrator、Worker、Supervisor、校验关卡、错误与状态
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock / 重试）
//! - **memory**: 对话消息与步骤日志
//! - **react**: Planner、Prompt、单任务 ReAct 状态机、Worker 通知
//! - **sandbox**: 生成代码的解释执行与持久化 Binding
//! - **tools**: Tool trait、注册表、Echo 与子智能体工具

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod react;
pub mod sandbox;
pub mod tools;

pub use agent::AgentConfig;
pub use core::{AgentError, Decision, Orchestrator, OrchestratorHandle, ValidationHandler};
