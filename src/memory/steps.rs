//! 步骤日志：任务标记 + 代码步骤，按提交顺序只追加
//!
//! 同一个 Worker 上跑多个任务时，日志跨任务保留（不截断），这是多轮上下文的来源。
//! `to_messages` 把日志渲染为模型可读的对话：任务 -> user，思考与代码 -> assistant，观察/错误 -> user。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::memory::Message;
use crate::sandbox::render_value;

/// Observation 中单个结果的最大字符数，避免把超长结果整段塞回上下文
const OBSERVATION_MAX_CHARS: usize = 4000;

/// 代码步骤的结果：要么是值，要么是错误文本，二者恰有其一
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum StepOutcome {
    Result(Value),
    Error(String),
}

/// 一次 think -> code -> execute -> observe
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionStep {
    /// 本任务内的步号，从 1 开始
    pub step: usize,
    pub thought: String,
    pub code: String,
    pub outcome: StepOutcome,
    /// 代码中 print(...) 的输出
    #[serde(default)]
    pub logs: Vec<String>,
}

impl ActionStep {
    pub fn is_error(&self) -> bool {
        matches!(self.outcome, StepOutcome::Error(_))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Step {
    /// 提交的任务本身
    Task(String),
    Action(ActionStep),
}

/// Worker 生命周期内的步骤日志
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMemory {
    steps: Vec<Step>,
}

impl AgentMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_task(&mut self, task: impl Into<String>) {
        self.steps.push(Step::Task(task.into()));
    }

    pub fn push_action(&mut self, step: ActionStep) {
        self.steps.push(Step::Action(step));
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// 最近一个任务之后的代码步骤
    pub fn current_task_actions(&self) -> impl Iterator<Item = &ActionStep> {
        let start = self
            .steps
            .iter()
            .rposition(|s| matches!(s, Step::Task(_)))
            .map(|i| i + 1)
            .unwrap_or(0);
        self.steps[start..].iter().filter_map(|s| match s {
            Step::Action(a) => Some(a),
            Step::Task(_) => None,
        })
    }

    /// 渲染为对话：system 在最前，随后逐步展开
    pub fn to_messages(&self, system_prompt: &str) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.steps.len() * 2 + 1);
        messages.push(Message::system(system_prompt));
        for step in &self.steps {
            match step {
                Step::Task(task) => messages.push(Message::user(format!("New task:\n{task}"))),
                Step::Action(action) => {
                    messages.push(Message::assistant(format!(
                        "Thought: {}\nCode:\n```\n{}\n```",
                        action.thought, action.code
                    )));
                    messages.push(Message::user(observation_text(action)));
                }
            }
        }
        messages
    }
}

fn observation_text(action: &ActionStep) -> String {
    let mut text = String::new();
    if !action.logs.is_empty() {
        text.push_str("Execution logs:\n");
        text.push_str(&action.logs.join("\n"));
        text.push('\n');
    }
    match &action.outcome {
        StepOutcome::Result(value) => {
            text.push_str("Observation:\n");
            text.push_str(&truncate(&render_value(value)));
        }
        StepOutcome::Error(err) => {
            text.push_str("Error:\n");
            text.push_str(&truncate(err));
            text.push_str("\nNow let's retry: take care not to repeat previous errors!");
        }
    }
    text
}

fn truncate(s: &str) -> String {
    if s.chars().count() > OBSERVATION_MAX_CHARS {
        let head: String = s.chars().take(OBSERVATION_MAX_CHARS).collect();
        format!("{head}... (truncated)")
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Role;
    use serde_json::json;

    fn action(step: usize, outcome: StepOutcome) -> ActionStep {
        ActionStep {
            step,
            thought: format!("thought {step}"),
            code: format!("x = {step}"),
            outcome,
            logs: vec![],
        }
    }

    #[test]
    fn test_transcript_interleaves_tasks_and_steps() {
        let mut memory = AgentMemory::new();
        memory.push_task("first");
        memory.push_action(action(1, StepOutcome::Result(json!(1))));
        memory.push_task("second");
        memory.push_action(action(1, StepOutcome::Error("boom".into())));

        let messages = memory.to_messages("sys");
        assert_eq!(messages.len(), 7);
        assert_eq!(messages[0].role, Role::System);
        assert!(messages[1].content.contains("first"));
        assert!(messages[3].content.contains("Observation:\n1"));
        assert!(messages[4].content.contains("second"));
        assert!(messages[6].content.contains("Error:\nboom"));
    }

    #[test]
    fn test_current_task_actions_only_after_last_task() {
        let mut memory = AgentMemory::new();
        memory.push_task("a");
        memory.push_action(action(1, StepOutcome::Result(json!(1))));
        memory.push_action(action(2, StepOutcome::Result(json!(2))));
        memory.push_task("b");
        memory.push_action(action(1, StepOutcome::Result(json!(3))));

        let steps: Vec<usize> = memory.current_task_actions().map(|a| a.step).collect();
        assert_eq!(steps, vec![1]);
        assert_eq!(memory.len(), 5);
    }

    #[test]
    fn test_logs_rendered_before_observation() {
        let mut memory = AgentMemory::new();
        let mut step = action(1, StepOutcome::Result(json!("done")));
        step.logs = vec!["hello".into()];
        memory.push_action(step);
        let messages = memory.to_messages("sys");
        assert_eq!(messages[2].content, "Execution logs:\nhello\nObservation:\ndone");
    }
}
