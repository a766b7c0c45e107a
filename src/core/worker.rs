//! Worker：一个智能体实例（主智能体或子智能体）的 actor
//!
//! 持有自己的配置、步骤日志与 Binding，只通过命令通道接收任务与决定，通过监听者通道发出通知。
//! 同一 Worker 上的多个任务共享步骤日志与用户变量；每个新任务开始时清空最终答案槽位、步号从 1 重新计。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent::AgentConfig;
use crate::core::orchestrator::WeakOrchestrator;
use crate::core::state::WorkerSnapshot;
use crate::core::supervisor::{WorkerCommand, WorkerId};
use crate::core::validation::Decision;
use crate::llm::LlmClient;
use crate::memory::AgentMemory;
use crate::react::{DecisionGate, Notifier, Planner, Stopped, TaskRun, WorkerEvent};
use crate::sandbox::Binding;
use crate::tools::{SubAgentTool, ToolRegistry};

/// 启动一个 Worker 所需的一切
pub struct WorkerContext {
    pub id: WorkerId,
    pub config: Arc<AgentConfig>,
    pub llm: Arc<dyn LlmClient>,
    /// 终态与过程通知的接收方
    pub listener: mpsc::UnboundedSender<WorkerEvent>,
    /// 子智能体调用经由它中转
    pub orchestrator: WeakOrchestrator,
    pub sub_agent_timeout: Duration,
    /// 之前任务留下的日志与变量
    pub seed: Option<WorkerSnapshot>,
}

pub struct Worker {
    config: Arc<AgentConfig>,
    planner: Planner,
    memory: AgentMemory,
    binding: Binding,
    notifier: Notifier,
    commands: mpsc::UnboundedReceiver<WorkerCommand>,
    cancel: CancellationToken,
}

impl Worker {
    pub fn new(
        ctx: WorkerContext,
        commands: mpsc::UnboundedReceiver<WorkerCommand>,
        cancel: CancellationToken,
    ) -> Self {
        let mut agents = ToolRegistry::new();
        for sub in &ctx.config.managed_agents {
            agents.register(SubAgentTool::new(
                sub.clone(),
                ctx.orchestrator.clone(),
                ctx.sub_agent_timeout,
            ));
        }

        let seed = ctx.seed.unwrap_or_default();
        let binding = Binding::new(ctx.config.tools.clone(), Arc::new(agents))
            .with_variables(seed.variables);
        let planner = Planner::new(ctx.llm, &ctx.config, &binding);
        let notifier = Notifier::new(ctx.id, ctx.config.name.clone(), ctx.listener);

        Self {
            config: ctx.config,
            planner,
            memory: seed.memory,
            binding,
            notifier,
            commands,
            cancel,
        }
    }

    /// 命令循环：收到 Stop、被取消或通道关闭时退出
    pub async fn run(mut self) {
        self.notifier.started();
        loop {
            let command = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                command = self.commands.recv() => command,
            };
            match command {
                Some(WorkerCommand::RunTask(task)) => {
                    if self.run_task(&task).await.is_err() {
                        break;
                    }
                }
                Some(WorkerCommand::Decision(decision)) => {
                    tracing::warn!(
                        worker = %self.notifier.worker(),
                        decision = decision.label(),
                        "Decision received while idle, ignored"
                    );
                }
                Some(WorkerCommand::Stop) | None => break,
            }
        }
        tracing::debug!(worker = %self.notifier.worker(), agent = %self.config.name, "Worker loop finished");
    }

    async fn run_task(&mut self, task: &str) -> Result<(), Stopped> {
        let worker = self.notifier.worker();
        tracing::info!(worker = %worker, agent = %self.config.name, "Task started: {}", task);

        let mut gate = ValidationGate {
            notifier: &self.notifier,
            commands: &mut self.commands,
            cancel: &self.cancel,
        };
        let outcome = TaskRun {
            agent: &self.config,
            planner: &self.planner,
            memory: &mut self.memory,
            binding: &mut self.binding,
            gate: &mut gate,
            notifier: &self.notifier,
            cancel: &self.cancel,
        }
        .run(task)
        .await
        .map_err(|stopped| {
            tracing::info!(worker = %worker, "Task interrupted by stop");
            stopped
        })?;

        tracing::info!(worker = %worker, agent = %self.config.name, phase = %outcome.phase(), "Task finished");
        // 任何终态都带上快照，主 Worker 重建时不丢失失败/被拒任务的记忆
        let snapshot = self.snapshot();
        self.notifier.outcome(outcome, snapshot);
        Ok(())
    }

    fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            memory: self.memory.clone(),
            variables: self.binding.variables().clone(),
        }
    }
}

/// 通过 Orchestrator 请求校验：发出 PendingValidation，然后只等 Decision
struct ValidationGate<'a> {
    notifier: &'a Notifier,
    commands: &'a mut mpsc::UnboundedReceiver<WorkerCommand>,
    cancel: &'a CancellationToken,
}

#[async_trait]
impl DecisionGate for ValidationGate<'_> {
    async fn request(&mut self, step: usize, thought: &str, code: &str) -> Option<Decision> {
        self.notifier.pending_validation(step, thought, code);
        loop {
            let command = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                command = self.commands.recv() => command,
            };
            match command {
                Some(WorkerCommand::Decision(decision)) => return Some(decision),
                Some(WorkerCommand::RunTask(_)) => {
                    tracing::warn!(worker = %self.notifier.worker(), "Task received while busy, ignored");
                }
                Some(WorkerCommand::Stop) | None => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{step_reply, LlmError, ScriptedLlmClient};

    fn spawn_worker(
        config: AgentConfig,
        llm: Arc<dyn LlmClient>,
        seed: Option<WorkerSnapshot>,
    ) -> (
        WorkerId,
        mpsc::UnboundedSender<WorkerCommand>,
        mpsc::UnboundedReceiver<WorkerEvent>,
    ) {
        let id = WorkerId::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let ctx = WorkerContext {
            id,
            config: Arc::new(config),
            llm,
            listener: events_tx,
            orchestrator: WeakOrchestrator::detached(),
            sub_agent_timeout: Duration::from_secs(1),
            seed,
        };
        tokio::spawn(Worker::new(ctx, cmd_rx, CancellationToken::new()).run());
        (id, cmd_tx, events_rx)
    }

    /// 跳过过程事件，取下一个边界事件
    async fn next_event(rx: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> WorkerEvent {
        loop {
            match rx.recv().await.unwrap() {
                WorkerEvent::Progress(_) => continue,
                event => return event,
            }
        }
    }

    #[tokio::test]
    async fn test_worker_waits_for_decision_before_executing() {
        let llm = Arc::new(ScriptedLlmClient::from_responses([step_reply(
            "answer",
            "tools.final_answer(6 * 7)",
        )]));
        let (id, cmd, mut events) = spawn_worker(AgentConfig::new("main"), llm, None);
        assert!(matches!(next_event(&mut events).await, WorkerEvent::Started { .. }));

        cmd.send(WorkerCommand::RunTask("t".to_string())).unwrap();
        match next_event(&mut events).await {
            WorkerEvent::PendingValidation { worker, step, code, .. } => {
                assert_eq!(worker, id);
                assert_eq!(step, 1);
                assert_eq!(code, "tools.final_answer(6 * 7)");
            }
            other => panic!("unexpected {:?}", other),
        }
        // 未决期间不会再有第二个请求
        assert!(events.try_recv().map(|e| !matches!(e, WorkerEvent::PendingValidation { .. })).unwrap_or(true));

        cmd.send(WorkerCommand::Decision(Decision::Approve)).unwrap();
        match next_event(&mut events).await {
            WorkerEvent::FinalResult { answer, snapshot, .. } => {
                assert_eq!(answer, "42");
                assert_eq!(snapshot.memory.len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_worker_restores_seed_variables() {
        let llm = Arc::new(ScriptedLlmClient::from_responses([step_reply(
            "reuse",
            "tools.final_answer(total * 3)",
        )]));
        let mut seed = WorkerSnapshot::default();
        seed.variables.insert("total".to_string(), serde_json::json!(15));
        let (_, cmd, mut events) = spawn_worker(AgentConfig::new("main"), llm, Some(seed));

        cmd.send(WorkerCommand::RunTask("Multiply that by 3".to_string())).unwrap();
        loop {
            match next_event(&mut events).await {
                WorkerEvent::PendingValidation { .. } => {
                    cmd.send(WorkerCommand::Decision(Decision::Approve)).unwrap();
                }
                WorkerEvent::FinalResult { answer, .. } => {
                    assert_eq!(answer, "45");
                    break;
                }
                WorkerEvent::Started { .. } => continue,
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_failed_task_still_carries_snapshot() {
        let llm = Arc::new(ScriptedLlmClient::from_results(vec![
            Ok(step_reply("partial", "y = 2")),
            Err(LlmError::Auth("denied".to_string())),
        ]));
        let mut seed = WorkerSnapshot::default();
        seed.variables.insert("x".to_string(), serde_json::json!(1));
        let (_, cmd, mut events) = spawn_worker(AgentConfig::new("main"), llm, Some(seed));

        cmd.send(WorkerCommand::RunTask("t".to_string())).unwrap();
        loop {
            match next_event(&mut events).await {
                WorkerEvent::PendingValidation { .. } => {
                    cmd.send(WorkerCommand::Decision(Decision::Approve)).unwrap();
                }
                WorkerEvent::Error { reason, snapshot, .. } => {
                    assert!(reason.contains("denied"));
                    assert_eq!(snapshot.variables.get("x"), Some(&serde_json::json!(1)));
                    assert_eq!(snapshot.variables.get("y"), Some(&serde_json::json!(2)));
                    // 任务标记 + 一个动作步骤
                    assert_eq!(snapshot.memory.len(), 2);
                    break;
                }
                WorkerEvent::Started { .. } => continue,
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_stop_while_awaiting_decision_sends_no_outcome() {
        let llm = Arc::new(ScriptedLlmClient::from_responses([step_reply("a", "a = 1")]));
        let (_, cmd, mut events) = spawn_worker(AgentConfig::new("main"), llm, None);
        cmd.send(WorkerCommand::RunTask("t".to_string())).unwrap();
        loop {
            if let WorkerEvent::PendingValidation { .. } = next_event(&mut events).await {
                break;
            }
        }
        cmd.send(WorkerCommand::Stop).unwrap();
        // Worker 退出后通道关闭，期间没有终态通知
        while let Some(event) = events.recv().await {
            assert!(matches!(event, WorkerEvent::Progress(_)), "unexpected {:?}", event);
        }
    }
}
