//! System prompt 组装：角色说明 + 执行语言速查 + tools / agents 文档 + 输出格式

use serde_json::Value;

use crate::agent::AgentConfig;
use crate::sandbox::Binding;

const ROLE: &str = "You are an expert assistant who solves tasks by writing code. \
You proceed in a cycle of steps: in each step you write a short 'thought' explaining your reasoning, \
then a 'code' snippet that is executed. The result (and anything you print) comes back as an Observation \
in the next message. Variables you assign persist across steps and across later tasks.";

const LANGUAGE: &str = "\
Code language reference:
- Statements are separated by newlines or ';'. Comments start with '#'.
- Assignment: name = expression
- Values: integers, floats, \"strings\", true, false, null, [lists], {\"objects\": 1}
- Operators: + - * / %  == != < <= > >=  && || !   indexing x[0], field access x.key
- Control flow: if cond { ... } else { ... }   for item in list { ... }
- Builtins: print(...), len, str, int, float, round(x, digits), abs, min, max, sum, range(n)
- Call a tool with tools.NAME(args...); call a team member with agents.NAME(\"task\").
- When you have the answer, call tools.final_answer(value). Nothing after it runs.";

const RULES: &str = "\
Rules:
1. Always return both 'thought' and 'code'.
2. Only use variables you have defined and tools / agents listed above.
3. Call at most one agent per step, and inspect its answer in the next step before relying on it.
4. Do not repeat a tool call with the same arguments; use the stored variable instead.
5. The task is only finished when you call tools.final_answer(...).";

/// 由配置与执行环境生成 system prompt
pub fn system_prompt(config: &AgentConfig, binding: &Binding, response_schema: &Value) -> String {
    let mut prompt = String::from(ROLE);
    if !config.instructions.trim().is_empty() {
        prompt.push_str("\n\n");
        prompt.push_str(config.instructions.trim());
    }
    prompt.push_str("\n\n");
    prompt.push_str(LANGUAGE);

    prompt.push_str("\n\nTools:\n- tools.final_answer(answer: any) -> any\n    Provides the final answer to the task.");
    if !binding.tools().is_empty() {
        prompt.push('\n');
        prompt.push_str(&binding.tools().describe("tools"));
    }

    if !binding.agents().is_empty() {
        prompt.push_str("\n\nTeam members (each takes a single task string and returns its answer as a string):\n");
        prompt.push_str(&binding.agents().describe("agents"));
    }

    prompt.push_str("\n\n");
    prompt.push_str(RULES);

    let schema = serde_json::to_string_pretty(response_schema).unwrap_or_default();
    prompt.push_str("\n\nRespond with a single JSON object matching this schema:\n");
    prompt.push_str(&schema);
    prompt.push_str("\nExample: {\"thought\": \"I will compute the sum.\", \"code\": \"total = 2 + 3\\nprint(total)\"}");
    prompt
}

/// 到达步数上限后追加的用户消息
pub const FORCE_FINAL: &str = "You have reached the maximum number of steps. \
Based on everything above, call tools.final_answer(...) NOW with your best answer. \
Your code must consist of that single call.";

/// 使用自定义 schema 强制收尾时的用户消息
pub fn force_final_structured(schema: &Value) -> String {
    format!(
        "You have reached the maximum number of steps. Based on everything above, give your final answer now \
as a single JSON object matching this schema:\n{}",
        serde_json::to_string_pretty(schema).unwrap_or_default()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;

    use crate::tools::{EchoTool, ToolRegistry};

    #[test]
    fn test_prompt_lists_tools_and_agents() {
        let config = AgentConfig::new("main").instructions("Be brief.");
        let mut tools = ToolRegistry::new();
        tools.register(EchoTool);
        let binding = Binding::new(Arc::new(tools), Arc::new(ToolRegistry::new()));
        let prompt = system_prompt(&config, &binding, &json!({"type": "object"}));
        assert!(prompt.contains("Be brief."));
        assert!(prompt.contains("tools.echo(text: string)"));
        assert!(prompt.contains("tools.final_answer"));
        assert!(!prompt.contains("Team members"));
    }
}
