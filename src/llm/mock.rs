//! Mock LLM 客户端（用于测试与离线运行，无需 API）
//!
//! - MockLlmClient：直接把最近一个任务的原文作为最终答案，便于本地跑通整条流程。
//! - ScriptedLlmClient：按脚本（固定序列或回调）返回，用于测试 Worker / Orchestrator。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{CompletionRequest, LlmClient, LlmError};
use crate::memory::{Message, Role};

/// Mock 客户端：回显最近的任务
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<String, LlmError> {
        let task = last_task(request.messages).unwrap_or("(no input)");
        let literal = serde_json::to_string(&format!("Echo from Mock: {task}"))
            .map_err(|e| LlmError::InvalidRequest(e.to_string()))?;
        let reply = serde_json::json!({
            "thought": "Mock model: answer with the task text.",
            "code": format!("tools.final_answer({literal})"),
        });
        Ok(reply.to_string())
    }
}

/// 对话中最近一个任务的文本（AgentMemory 渲染为 "New task:\n..."）
pub fn last_task(messages: &[Message]) -> Option<&str> {
    messages
        .iter()
        .rev()
        .filter(|m| m.role == Role::User)
        .find_map(|m| m.content.strip_prefix("New task:\n"))
}

type Responder = dyn Fn(&CompletionRequest<'_>) -> Result<String, LlmError> + Send + Sync;

enum Script {
    Queue(Mutex<VecDeque<Result<String, LlmError>>>),
    Func(Box<Responder>),
}

/// 脚本化客户端：记录调用次数，队列耗尽后返回 Transport 错误
pub struct ScriptedLlmClient {
    script: Script,
    calls: AtomicUsize,
}

impl ScriptedLlmClient {
    /// 依次返回给定文本
    pub fn from_responses<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_results(responses.into_iter().map(|s| Ok(s.into())).collect())
    }

    pub fn from_results(results: Vec<Result<String, LlmError>>) -> Self {
        Self {
            script: Script::Queue(Mutex::new(results.into())),
            calls: AtomicUsize::new(0),
        }
    }

    /// 由回调决定每次返回什么（可按 system prompt 区分不同智能体）
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&CompletionRequest<'_>) -> Result<String, LlmError> + Send + Sync + 'static,
    {
        Self {
            script: Script::Func(Box::new(f)),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            Script::Queue(queue) => queue
                .lock()
                .map_err(|_| LlmError::Transport("script lock poisoned".to_string()))?
                .pop_front()
                .unwrap_or_else(|| Err(LlmError::Transport("script exhausted".to_string()))),
            Script::Func(f) => f(&request),
        }
    }
}

/// 组装一条 {thought, code} 回复，测试里写脚本用
pub fn step_reply(thought: &str, code: &str) -> String {
    serde_json::json!({ "thought": thought, "code": code }).to_string()
}
