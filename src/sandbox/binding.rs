//! Binding：持久化的执行环境
//!
//! 只读的工具表 / 子智能体表（Arc 共享）+ 跨步骤累积的用户变量 + 显式的最终答案槽位。
//! 新任务开始前必须调用 clear_final_answer，否则新任务第 1 步会被误判为已完成。

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::sandbox::{execute, Execution, SandboxError};
use crate::tools::ToolRegistry;

#[derive(Clone, Debug, Default)]
pub struct Binding {
    tools: Arc<ToolRegistry>,
    agents: Arc<ToolRegistry>,
    variables: BTreeMap<String, Value>,
    final_answer: Option<Value>,
}

impl Binding {
    pub fn new(tools: Arc<ToolRegistry>, agents: Arc<ToolRegistry>) -> Self {
        Self {
            tools,
            agents,
            variables: BTreeMap::new(),
            final_answer: None,
        }
    }

    /// 恢复之前任务留下的用户变量
    pub fn with_variables(mut self, variables: BTreeMap<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn agents(&self) -> &ToolRegistry {
        &self.agents
    }

    pub fn variables(&self) -> &BTreeMap<String, Value> {
        &self.variables
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn final_answer(&self) -> Option<&Value> {
        self.final_answer.as_ref()
    }

    pub fn clear_final_answer(&mut self) {
        self.final_answer = None;
    }

    /// 合并一次成功执行的结果：只写用户变量与最终答案槽位，工具表不受影响
    pub fn apply(&mut self, execution: &Execution) {
        for (name, value) in &execution.assigned {
            self.variables.insert(name.clone(), value.clone());
        }
        if let Some(answer) = &execution.final_answer {
            self.final_answer = Some(answer.clone());
        }
    }

    /// 在当前快照上执行代码，不修改 self
    pub async fn execute(&self, code: &str) -> Result<Execution, SandboxError> {
        execute(code, self).await
    }
}
