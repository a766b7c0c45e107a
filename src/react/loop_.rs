//! 单个任务的 ReAct 状态机
//!
//! Running(step) -> AwaitingValidation -> 执行 / 反馈 / 拒绝 -> ... -> Completed | Failed | Rejected。
//! 每一步都必须先拿到 Decision 才执行代码；到达步数上限后进入 ForcingFinal，
//! 再做一次模型调用并直接执行（不经校验），保证 max_steps = K 时最多 K + 1 次模型调用。

use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::agent::AgentConfig;
use crate::core::state::{TaskOutcome, WorkerPhase, NO_FINAL_ANSWER};
use crate::core::validation::Decision;
use crate::memory::{ActionStep, AgentMemory, StepOutcome};
use crate::react::events::Notifier;
use crate::react::planner::{PlanError, Planner, StepPlan};
use crate::sandbox::{render_value, Binding};

/// 每个代码步骤执行前向它要一个 Decision
#[async_trait]
pub trait DecisionGate: Send + Sync {
    /// None 表示等待期间 Worker 被停止
    async fn request(&mut self, step: usize, thought: &str, code: &str) -> Option<Decision>;
}

/// 任务在完成前被停止（Worker 收到 Stop 或被取消）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stopped;

/// 一次任务运行所需的全部借用
pub struct TaskRun<'a> {
    pub agent: &'a AgentConfig,
    pub planner: &'a Planner,
    pub memory: &'a mut AgentMemory,
    pub binding: &'a mut Binding,
    pub gate: &'a mut dyn DecisionGate,
    pub notifier: &'a Notifier,
    pub cancel: &'a CancellationToken,
}

impl TaskRun<'_> {
    /// 跑完一个任务；Err(Stopped) 时不产生终态通知
    pub async fn run(mut self, task: &str) -> Result<TaskOutcome, Stopped> {
        self.memory.push_task(task);
        self.binding.clear_final_answer();
        let max_steps = self.agent.max_steps;
        let mut step = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Err(Stopped);
            }
            if step >= max_steps {
                return self.force_final(step + 1).await;
            }
            step += 1;
            self.trace(WorkerPhase::Running { step });
            self.notifier.step_update(step, max_steps);

            let plan = match self.cancellable(self.planner.plan(&*self.memory)).await? {
                Ok(plan) => plan,
                Err(PlanError::Decode { message, raw }) => {
                    tracing::warn!(agent = %self.agent.name, step, "Model output not decodable: {}", message);
                    self.record(step, String::new(), raw, StepOutcome::Error(format!("Error in code parsing: {message}. Reply with a JSON object with 'thought' and 'code'.")), Vec::new());
                    continue;
                }
                Err(PlanError::Llm(e)) => {
                    tracing::error!(agent = %self.agent.name, step, "Model call failed: {}", e);
                    return Ok(TaskOutcome::Failed(format!("model call failed: {e}")));
                }
            };

            self.trace(WorkerPhase::AwaitingValidation { step });
            let decision = self
                .gate
                .request(step, &plan.thought, &plan.code)
                .await
                .ok_or(Stopped)?;
            tracing::info!(agent = %self.agent.name, step, decision = decision.label(), "Validation decision");
            self.notifier.decision(step, &decision);

            let code = match decision {
                Decision::Approve => plan.code,
                Decision::Modify(code) => code,
                Decision::Feedback(message) => {
                    self.record(step, plan.thought, plan.code, StepOutcome::Error(format!("User feedback: {message}")), Vec::new());
                    continue;
                }
                Decision::Reject => return Ok(TaskOutcome::Rejected),
            };

            if let Some(answer) = self.execute_step(step, plan.thought, code).await? {
                return Ok(TaskOutcome::Completed(answer));
            }
        }
    }

    async fn force_final(&mut self, step: usize) -> Result<TaskOutcome, Stopped> {
        self.trace(WorkerPhase::ForcingFinal);
        tracing::warn!(agent = %self.agent.name, "Max steps reached, forcing final answer without validation");
        self.notifier.forcing_final();

        let agent: &AgentConfig = self.agent;
        if let Some(schema) = &agent.final_answer_schema {
            return match self.cancellable(self.planner.final_structured(&*self.memory, schema)).await? {
                Ok(answer) => {
                    let rendered = render_value(&answer);
                    self.record(step, "Final answer".to_string(), String::new(), StepOutcome::Result(answer), Vec::new());
                    Ok(TaskOutcome::Completed(rendered))
                }
                Err(PlanError::Llm(e)) => Ok(TaskOutcome::Failed(format!("model call failed: {e}"))),
                Err(PlanError::Decode { message, raw }) => {
                    self.record(step, String::new(), raw, StepOutcome::Error(format!("Error in final answer parsing: {message}")), Vec::new());
                    Ok(TaskOutcome::Failed(NO_FINAL_ANSWER.to_string()))
                }
            };
        }

        let plan: StepPlan = match self.cancellable(self.planner.plan_final(&*self.memory)).await? {
            Ok(plan) => plan,
            Err(PlanError::Llm(e)) => return Ok(TaskOutcome::Failed(format!("model call failed: {e}"))),
            Err(PlanError::Decode { message, raw }) => {
                self.record(step, String::new(), raw, StepOutcome::Error(format!("Error in code parsing: {message}")), Vec::new());
                return Ok(TaskOutcome::Failed(NO_FINAL_ANSWER.to_string()));
            }
        };
        match self.execute_step(step, plan.thought, plan.code).await? {
            Some(answer) => Ok(TaskOutcome::Completed(answer)),
            None => Ok(TaskOutcome::Failed(NO_FINAL_ANSWER.to_string())),
        }
    }

    /// 执行并记录一步；给出最终答案时返回渲染后的答案
    async fn execute_step(&mut self, step: usize, thought: String, code: String) -> Result<Option<String>, Stopped> {
        let started = Instant::now();
        let result = self.cancellable(self.binding.execute(&code)).await?;
        let duration_ms = started.elapsed().as_millis() as u64;

        let audit = serde_json::json!({
            "event": "code_audit",
            "agent": self.agent.name,
            "worker": self.notifier.worker().to_string(),
            "step": step,
            "ok": result.is_ok(),
            "duration_ms": duration_ms,
        });
        tracing::info!(audit = %audit.to_string(), "code");

        match result {
            Ok(execution) => {
                self.binding.apply(&execution);
                self.notifier.observation(step, true, &render_value(&execution.value));
                self.record(step, thought, code, StepOutcome::Result(execution.value), execution.logs);
                Ok(self.binding.final_answer().map(render_value))
            }
            Err(e) => {
                let message = e.to_string();
                tracing::debug!(agent = %self.agent.name, step, "Code step failed: {}", message);
                self.notifier.observation(step, false, &message);
                self.record(step, thought, code, StepOutcome::Error(message), Vec::new());
                Ok(None)
            }
        }
    }

    fn record(&mut self, step: usize, thought: String, code: String, outcome: StepOutcome, logs: Vec<String>) {
        self.memory.push_action(ActionStep {
            step,
            thought,
            code,
            outcome,
            logs,
        });
    }

    async fn cancellable<F: std::future::Future>(&self, fut: F) -> Result<F::Output, Stopped> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Stopped),
            out = fut => Ok(out),
        }
    }

    fn trace(&self, phase: WorkerPhase) {
        tracing::debug!(agent = %self.agent.name, phase = %phase, "Worker phase");
    }
}
