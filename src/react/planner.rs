//! Planner：组装请求并解码模型输出为 {thought, code}
//!
//! 模型原始文本先按 JSON 解析（支持 ```json 代码块或裸 JSON），失败时退回 "Thought: ... Code: ```...```" 文本格式；
//! 两者都失败则返回 PlanError::Decode，由循环记为步骤错误让模型自行纠正。

use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::agent::AgentConfig;
use crate::llm::{CompletionRequest, LlmClient, LlmError, ModelOptions};
use crate::memory::{AgentMemory, Message};
use crate::react::prompt;
use crate::sandbox::Binding;

/// 模型每一步的结构化输出
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StepPlan {
    /// 对下一步的推理
    pub thought: String,
    /// 要执行的代码
    pub code: String,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    /// 传输 / 鉴权等，任务以 Failed 结束
    #[error(transparent)]
    Llm(#[from] LlmError),

    /// 输出无法解码，记为步骤错误
    #[error("Error in code parsing: {message}")]
    Decode { message: String, raw: String },
}

/// 从文本中提取 JSON：优先 ```json 代码块，否则取第一个 '{' 到最后一个 '}'
pub(crate) fn extract_json(output: &str) -> Option<&str> {
    let trimmed = output.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

/// 解码一步输出
pub fn parse_step(output: &str) -> Result<StepPlan, PlanError> {
    let decode_error = |message: String| PlanError::Decode {
        message,
        raw: output.to_string(),
    };

    let plan = match extract_json(output).map(serde_json::from_str::<StepPlan>) {
        Some(Ok(plan)) => plan,
        Some(Err(e)) => parse_text_step(output).ok_or_else(|| decode_error(e.to_string()))?,
        None => parse_text_step(output).ok_or_else(|| {
            decode_error("expected a JSON object with 'thought' and 'code'".to_string())
        })?,
    };

    let code = strip_code_fence(&plan.code);
    if code.trim().is_empty() {
        return Err(decode_error("the 'code' field is empty".to_string()));
    }
    Ok(StepPlan {
        thought: plan.thought.trim().to_string(),
        code,
    })
}

/// 文本格式："Thought: ...\nCode:\n```\n...\n```"
fn parse_text_step(output: &str) -> Option<StepPlan> {
    let fence = output.find("```")?;
    let after = &output[fence + 3..];
    let body_start = after.find('\n')? + 1;
    let body = &after[body_start..];
    let end = body.find("```")?;
    let code = body[..end].trim().to_string();

    let head = output[..fence].trim();
    let head = head.strip_suffix("Code:").unwrap_or(head).trim();
    let thought = head.strip_prefix("Thought:").unwrap_or(head).trim().to_string();
    Some(StepPlan { thought, code })
}

/// 去掉代码外层的 ``` 围栏（模型有时会在 JSON 字段里再包一层）
fn strip_code_fence(code: &str) -> String {
    let trimmed = code.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let body = match rest.find('\n') {
            Some(i) => &rest[i + 1..],
            None => rest,
        };
        body.trim_end().strip_suffix("```").unwrap_or(body).trim().to_string()
    } else {
        trimmed.to_string()
    }
}

/// Planner：持有 LLM、system prompt 与响应 schema
pub struct Planner {
    llm: Arc<dyn LlmClient>,
    model: String,
    options: ModelOptions,
    system_prompt: String,
    schema: Value,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>, config: &AgentConfig, binding: &Binding) -> Self {
        let schema = serde_json::to_value(schemars::schema_for!(StepPlan)).unwrap_or(Value::Null);
        let system_prompt = prompt::system_prompt(config, binding, &schema);
        Self {
            llm,
            model: config.model.clone(),
            options: config.options.clone(),
            system_prompt,
            schema,
        }
    }


    async fn complete(&self, messages: &[Message], schema: &Value) -> Result<String, LlmError> {
        self.llm
            .complete(CompletionRequest {
                model: &self.model,
                messages,
                response_schema: schema,
                options: &self.options,
            })
            .await
    }

    /// 普通一步
    pub async fn plan(&self, memory: &AgentMemory) -> Result<StepPlan, PlanError> {
        let messages = memory.to_messages(&self.system_prompt);
        let output = self.complete(&messages, &self.schema).await?;
        parse_step(&output)
    }

    /// 强制收尾：追加指令要求立即调用 final_answer
    pub async fn plan_final(&self, memory: &AgentMemory) -> Result<StepPlan, PlanError> {
        let mut messages = memory.to_messages(&self.system_prompt);
        messages.push(Message::user(prompt::FORCE_FINAL));
        let output = self.complete(&messages, &self.schema).await?;
        parse_step(&output)
    }

    /// 强制收尾：按自定义 schema 直接输出最终答案
    pub async fn final_structured(&self, memory: &AgentMemory, schema: &Value) -> Result<Value, PlanError> {
        let mut messages = memory.to_messages(&self.system_prompt);
        messages.push(Message::user(prompt::force_final_structured(schema)));
        let output = self.complete(&messages, schema).await?;
        let json = extract_json(&output).ok_or_else(|| PlanError::Decode {
            message: "expected a JSON object".to_string(),
            raw: output.clone(),
        })?;
        serde_json::from_str(json).map_err(|e| PlanError::Decode {
            message: e.to_string(),
            raw: output.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;

    #[test]
    fn test_parse_plain_json() {
        let plan = parse_step(r#"{"thought": "add", "code": "x = 1 + 2"}"#).unwrap();
        assert_eq!(plan.thought, "add");
        assert_eq!(plan.code, "x = 1 + 2");
    }

    #[test]
    fn test_parse_fenced_json_and_fenced_code() {
        let raw = "Sure:\n```json\n{\"thought\": \"t\", \"code\": \"y = 2\"}\n```";
        assert_eq!(parse_step(raw).unwrap().code, "y = 2");

        let raw = "{\"thought\": \"t\", \"code\": \"```\\nprint(1)\\n```\"}";
        assert_eq!(parse_step(raw).unwrap().code, "print(1)");
    }

    #[test]
    fn test_parse_text_format() {
        let raw = "Thought: loop over items\nCode:\n```py\nfor i in [1, 2] { print(i) }\n```";
        let plan = parse_step(raw).unwrap();
        assert_eq!(plan.thought, "loop over items");
        assert_eq!(plan.code, "for i in [1, 2] { print(i) }");
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(parse_step("I am not sure."), Err(PlanError::Decode { .. })));
        assert!(matches!(
            parse_step(r#"{"thought": "t", "code": "  "}"#),
            Err(PlanError::Decode { .. })
        ));
        match parse_step(r#"{"thought": "missing code"}"#) {
            Err(PlanError::Decode { raw, .. }) => assert!(raw.contains("missing code")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_plan_final_appends_instruction() {
        let llm = Arc::new(ScriptedLlmClient::from_fn(|req| {
            let last = req.messages.last().map(|m| m.content.clone()).unwrap_or_default();
            assert!(last.contains("maximum number of steps"));
            Ok(r#"{"thought": "done", "code": "tools.final_answer(1)"}"#.to_string())
        }));
        let config = AgentConfig::new("main");
        let planner = Planner::new(llm, &config, &Binding::default());
        let mut memory = AgentMemory::new();
        memory.push_task("t");
        let plan = planner.plan_final(&memory).await.unwrap();
        assert_eq!(plan.code, "tools.final_answer(1)");
    }
}
