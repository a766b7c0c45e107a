//! 子智能体工具：把一个受管智能体暴露为 `agents.NAME(task)`
//!
//! 调用会经 Orchestrator 启动一个子 Worker，并阻塞当前代码步骤直到该子 Worker 的终态通知到达。
//! 子智能体的失败、拒绝、超时都以 "Error: ..." 字符串返回，父智能体可以在下一步据此调整。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::agent::AgentConfig;
use crate::core::orchestrator::WeakOrchestrator;
use crate::sandbox::render_value;
use crate::tools::{Tool, ToolInput};

pub struct SubAgentTool {
    config: Arc<AgentConfig>,
    description: String,
    orchestrator: WeakOrchestrator,
    timeout: Duration,
}

impl SubAgentTool {
    pub fn new(config: Arc<AgentConfig>, orchestrator: WeakOrchestrator, timeout: Duration) -> Self {
        let description = if config.description.trim().is_empty() {
            format!("Team member '{}'. Give it a complete, self-contained task.", config.name)
        } else {
            config.description.clone()
        };
        Self {
            config,
            description,
            orchestrator,
            timeout,
        }
    }
}

#[async_trait]
impl Tool for SubAgentTool {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn inputs(&self) -> Vec<ToolInput> {
        vec![ToolInput::new(
            "task",
            "string",
            "what the team member should do, with all the details it needs",
        )]
    }

    async fn call(&self, args: Vec<Value>) -> Result<Value, String> {
        let task = match args.as_slice() {
            [Value::String(task)] => task.clone(),
            [other] => render_value(other),
            _ => {
                return Err(format!(
                    "agents.{} expects exactly one argument (task), got {}",
                    self.config.name,
                    args.len()
                ))
            }
        };
        let answer = match self.orchestrator.upgrade() {
            Some(orchestrator) => {
                orchestrator
                    .track_sub_agent(self.config.clone(), task, self.timeout)
                    .await
            }
            None => format!(
                "Error: sub-agent '{}' is unavailable: orchestrator stopped",
                self.config.name
            ),
        };
        Ok(Value::String(answer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_detached_tool_reports_error_string() {
        let tool = SubAgentTool::new(
            Arc::new(AgentConfig::new("calculator")),
            WeakOrchestrator::detached(),
            Duration::from_secs(1),
        );
        assert!(tool.description().contains("calculator"));
        let out = tool.call(vec![Value::String("2+2".into())]).await.unwrap();
        assert!(out.as_str().unwrap().starts_with("Error: sub-agent 'calculator'"));
        assert!(tool.call(vec![]).await.is_err());
    }
}
