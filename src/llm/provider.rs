//! 根据配置与环境变量选择 LLM 后端（DeepSeek / OpenAI 兼容 / Mock）

use std::sync::Arc;

use crate::config::LlmSection;
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient, RetryConfig, RetryingLlmClient};

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";

/// provider 为 mock 或找不到 API Key 时退回 Mock 客户端；max_retries > 0 时套一层重试
pub fn create_llm_from_config(cfg: &LlmSection) -> Arc<dyn LlmClient> {
    let provider = cfg.provider.to_lowercase();
    let deepseek_key = std::env::var("DEEPSEEK_API_KEY").ok();
    let openai_key = std::env::var("OPENAI_API_KEY").ok();

    let client: Arc<dyn LlmClient> = match provider.as_str() {
        "deepseek" if deepseek_key.is_some() || openai_key.is_some() => {
            let base = cfg.base_url.as_deref().unwrap_or(DEEPSEEK_BASE_URL);
            tracing::info!("Using DeepSeek LLM ({})", cfg.model);
            Arc::new(OpenAiClient::new(
                Some(base),
                &cfg.model,
                deepseek_key.or(openai_key).as_deref(),
            ))
        }
        "openai" if openai_key.is_some() => {
            tracing::info!("Using OpenAI LLM ({})", cfg.model);
            Arc::new(OpenAiClient::new(
                cfg.base_url.as_deref(),
                &cfg.model,
                openai_key.as_deref(),
            ))
        }
        "mock" => {
            tracing::info!("Using Mock LLM");
            return Arc::new(MockLlmClient);
        }
        _ => {
            tracing::warn!("No API key set or provider unknown ({}), using Mock LLM", provider);
            return Arc::new(MockLlmClient);
        }
    };

    if cfg.max_retries == 0 {
        return client;
    }
    Arc::new(RetryingLlmClient::new(
        client,
        RetryConfig {
            max_retries: cfg.max_retries,
            base_delay_ms: cfg.retry_base_delay_ms,
        },
    ))
}
