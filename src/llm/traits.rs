//! LLM 客户端抽象
//!
//! Worker 只依赖 LlmClient::complete：给定模型 id、对话、期望的响应 schema 与调用选项，返回模型原始文本；
//! 结构化解码由 Planner 负责。RetryingLlmClient 在客户端这一层做有限次退避重试，Worker 自身从不重试。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::memory::Message;

/// 模型调用失败（网络、鉴权、限流、请求构造）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited (retry after {retry_after_ms} ms)")]
    RateLimited { retry_after_ms: u64 },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl LlmError {
    /// 鉴权与请求构造错误重试也没用
    pub fn is_retryable(&self) -> bool {
        matches!(self, LlmError::Transport(_) | LlmError::RateLimited { .. })
    }
}

/// 模型调用选项
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelOptions {
    pub temperature: Option<f32>,
}

/// 一次补全请求
#[derive(Clone, Copy, Debug)]
pub struct CompletionRequest<'a> {
    /// 为空时由客户端使用其默认模型
    pub model: &'a str,
    pub messages: &'a [Message],
    /// 期望的响应 JSON Schema
    pub response_schema: &'a Value,
    pub options: &'a ModelOptions,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<String, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// 重试配置：最多重试 max_retries 次，间隔按 base_delay_ms * 2^n 增长
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 500,
        }
    }
}

impl RetryConfig {
    fn delay(&self, attempt: u32, err: &LlmError) -> Duration {
        let backoff = self.base_delay_ms.saturating_mul(1u64 << attempt.min(16));
        match err {
            LlmError::RateLimited { retry_after_ms } => Duration::from_millis((*retry_after_ms).max(backoff)),
            _ => Duration::from_millis(backoff),
        }
    }
}

/// 给任意 LlmClient 加上退避重试
pub struct RetryingLlmClient {
    inner: Arc<dyn LlmClient>,
    config: RetryConfig,
}

impl RetryingLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl LlmClient for RetryingLlmClient {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<String, LlmError> {
        let mut attempt = 0;
        loop {
            match self.inner.complete(request).await {
                Ok(text) => return Ok(text),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let delay = self.config.delay(attempt, &e);
                    tracing::warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "LLM call failed ({}), retrying",
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.inner.token_usage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;

    fn request<'a>(messages: &'a [Message], schema: &'a Value, options: &'a ModelOptions) -> CompletionRequest<'a> {
        CompletionRequest {
            model: "m",
            messages,
            response_schema: schema,
            options,
        }
    }

    struct Metered;

    #[async_trait]
    impl LlmClient for Metered {
        async fn complete(&self, _request: CompletionRequest<'_>) -> Result<String, LlmError> {
            Ok(String::new())
        }

        fn token_usage(&self) -> (u64, u64, u64) {
            (12, 3, 15)
        }
    }

    #[test]
    fn test_retrying_client_reports_inner_usage() {
        let client = RetryingLlmClient::new(Arc::new(Metered), RetryConfig::default());
        assert_eq!(client.token_usage(), (12, 3, 15));
        // 默认实现不统计
        assert_eq!(ScriptedLlmClient::from_responses(Vec::<String>::new()).token_usage(), (0, 0, 0));
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let inner = Arc::new(ScriptedLlmClient::from_results(vec![
            Err(LlmError::Transport("reset".into())),
            Ok("ok".into()),
        ]));
        let client = RetryingLlmClient::new(
            inner.clone(),
            RetryConfig {
                max_retries: 2,
                base_delay_ms: 1,
            },
        );
        let (schema, options) = (Value::Null, ModelOptions::default());
        let out = client.complete(request(&[], &schema, &options)).await;
        assert_eq!(out, Ok("ok".to_string()));
        assert_eq!(inner.calls(), 2);
    }

    #[tokio::test]
    async fn test_auth_error_not_retried() {
        let inner = Arc::new(ScriptedLlmClient::from_results(vec![
            Err(LlmError::Auth("bad key".into())),
            Ok("never".into()),
        ]));
        let client = RetryingLlmClient::new(inner.clone(), RetryConfig::default());
        let (schema, options) = (Value::Null, ModelOptions::default());
        let out = client.complete(request(&[], &schema, &options)).await;
        assert!(matches!(out, Err(LlmError::Auth(_))));
        assert_eq!(inner.calls(), 1);
    }
}
