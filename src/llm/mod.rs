//! LLM 层：客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）

pub mod mock;
pub mod openai;
pub mod provider;
pub mod traits;

pub use mock::{last_task, step_reply, MockLlmClient, ScriptedLlmClient};
pub use openai::{OpenAiClient, TokenUsage};
pub use provider::{create_llm_from_config, DEEPSEEK_BASE_URL, DEEPSEEK_CHAT};
pub use traits::{CompletionRequest, LlmClient, LlmError, ModelOptions, RetryConfig, RetryingLlmClient};
