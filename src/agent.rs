//! 智能体配置
//!
//! AgentConfig 描述一个智能体：名称、说明、指令、工具表、子智能体、模型与步数上限。
//! 由调用方构建一次，之后只读；每个 Worker 启动时按值（Arc）持有一份。
//! 子智能体的 I/O 由同一个 Orchestrator 中转，这个引用在 Worker 启动时注入，不存放在配置里。

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;

use crate::llm::ModelOptions;
use crate::tools::{Tool, ToolRegistry};

/// 生成代码里不能用作 `tools.` / `agents.` 名称的词
const RESERVED_NAMES: &[&str] = &[
    "if", "else", "for", "in", "true", "false", "null", "tools", "agents", "final_answer",
];

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub name: String,
    /// 作为子智能体时展示给父智能体的说明
    pub description: String,
    /// 追加到 system prompt 的自由文本指令
    pub instructions: String,
    pub tools: Arc<ToolRegistry>,
    pub managed_agents: Vec<Arc<AgentConfig>>,
    /// 模型 id，为空时使用客户端默认模型
    pub model: String,
    pub max_steps: usize,
    pub options: ModelOptions,
    /// 强制收尾时要求模型按此 schema 直接输出最终答案
    pub final_answer_schema: Option<Value>,
}

impl AgentConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            instructions: String::new(),
            tools: Arc::new(ToolRegistry::new()),
            managed_agents: Vec::new(),
            model: String::new(),
            max_steps: 10,
            options: ModelOptions::default(),
            final_answer_schema: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn options(mut self, options: ModelOptions) -> Self {
        self.options = options;
        self
    }

    pub fn final_answer_schema(mut self, schema: Value) -> Self {
        self.final_answer_schema = Some(schema);
        self
    }

    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = Arc::new(tools);
        self
    }

    pub fn tool(mut self, tool: impl Tool + 'static) -> Self {
        Arc::make_mut(&mut self.tools).register(tool);
        self
    }

    pub fn managed_agent(mut self, agent: AgentConfig) -> Self {
        self.managed_agents.push(Arc::new(agent));
        self
    }

    /// 启动 Worker 前的检查：名称合法、步数至少 1、子智能体不重名（递归）
    pub fn validate(&self) -> Result<(), String> {
        if !is_identifier(&self.name) {
            return Err(format!(
                "agent name '{}' must be an identifier ([A-Za-z_][A-Za-z0-9_]*)",
                self.name
            ));
        }
        if self.max_steps == 0 {
            return Err(format!("agent '{}': max_steps must be at least 1", self.name));
        }
        let mut seen = HashSet::new();
        for agent in &self.managed_agents {
            if RESERVED_NAMES.contains(&agent.name.as_str()) {
                return Err(format!("sub-agent name '{}' is reserved", agent.name));
            }
            if !seen.insert(agent.name.as_str()) {
                return Err(format!(
                    "agent '{}' has two sub-agents named '{}'",
                    self.name, agent.name
                ));
            }
            agent.validate()?;
        }
        Ok(())
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::EchoTool;

    #[test]
    fn test_builder_and_validate() {
        let cfg = AgentConfig::new("main")
            .tool(EchoTool)
            .max_steps(3)
            .managed_agent(AgentConfig::new("calculator").description("does math"));
        assert!(cfg.validate().is_ok());
        assert!(cfg.tools.contains("echo"));
        assert_eq!(cfg.managed_agents[0].description, "does math");
    }

    #[test]
    fn test_invalid_configs() {
        assert!(AgentConfig::new("has space").validate().is_err());
        assert!(AgentConfig::new("a").max_steps(0).validate().is_err());
        let dup = AgentConfig::new("main")
            .managed_agent(AgentConfig::new("x"))
            .managed_agent(AgentConfig::new("x"));
        assert!(dup.validate().unwrap_err().contains("two sub-agents"));
        let reserved = AgentConfig::new("main").managed_agent(AgentConfig::new("tools"));
        assert!(reserved.validate().is_err());
    }
}
