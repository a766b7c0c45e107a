//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / inputs / output_type / call），由 ToolRegistry 按名注册与查找。
//! 生成的代码通过 `tools.NAME(...)` 调用；子智能体也以 Tool 的形式挂在 `agents.NAME(...)` 下。
//! 注册表放进 Binding 后只读，多个 Worker 可以同时持有同一份 Arc。

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

/// 保留的工具名：调用它即表示给出最终答案，由沙箱拦截，不会落到注册表
pub const FINAL_ANSWER_TOOL: &str = "final_answer";

/// 工具的一个入参（供 prompt 文档使用）
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ToolInput {
    pub name: String,
    /// 类型标签，如 string / number / object
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
}

impl ToolInput {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            description: description.into(),
        }
    }
}

/// 工具 trait：参数按位置传入（任意个数），返回 JSON 值
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（代码中的 `tools.NAME`）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 入参说明，默认无参数
    fn inputs(&self) -> Vec<ToolInput> {
        Vec::new()
    }

    /// 返回值类型标签
    fn output_type(&self) -> &str {
        "string"
    }

    async fn call(&self, args: Vec<Value>) -> Result<Value, String>;
}

/// 按名称存储 Arc<dyn Tool>；BTreeMap 让 prompt 中的工具顺序稳定
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if name == FINAL_ANSWER_TOOL {
            tracing::warn!("Tool name '{}' is reserved, registration ignored", name);
            return;
        }
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 生成 prompt 中的函数签名与说明，`namespace` 为 tools / agents
    pub fn describe(&self, namespace: &str) -> String {
        self.tools
            .values()
            .map(|tool| {
                let inputs = tool.inputs();
                let params: Vec<String> = inputs
                    .iter()
                    .map(|i| format!("{}: {}", i.name, i.kind))
                    .collect();
                let mut doc = format!(
                    "- {namespace}.{}({}) -> {}\n    {}",
                    tool.name(),
                    params.join(", "),
                    tool.output_type(),
                    tool.description()
                );
                for input in &inputs {
                    doc.push_str(&format!("\n    {}: {}", input.name, input.description));
                }
                doc
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.tools.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::EchoTool;

    struct Impostor;

    #[async_trait]
    impl Tool for Impostor {
        fn name(&self) -> &str {
            FINAL_ANSWER_TOOL
        }

        fn description(&self) -> &str {
            "pretends to finish"
        }

        async fn call(&self, _args: Vec<Value>) -> Result<Value, String> {
            Ok(Value::Null)
        }
    }

    #[test]
    fn test_reserved_name_not_registered() {
        let mut registry = ToolRegistry::new();
        registry.register(Impostor);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_describe_lists_signature_and_inputs() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        let doc = registry.describe("tools");
        assert!(doc.starts_with("- tools.echo(text: string) -> string"));
        assert!(doc.contains("text: "));
    }
}
