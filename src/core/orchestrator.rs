//! Orchestrator：唯一的对外入口
//!
//! 后台单任务循环按到达顺序处理两路消息：调用方命令（run_task / 子智能体 / 决定 / 停止）与 Worker 通知。
//! 所有可变状态（主 Worker、待回复的调用方、子智能体跟踪表、待校验集合）只在这个循环里修改，无需加锁。
//!
//! 终态通知的分派：属于主 Worker 的回复给 run_task 调用方并保存快照；属于某个子智能体的
//! 回复给对应的 track_sub_agent 调用方并移除该条目。并发的多个子智能体因此不会串线。

use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};

use crate::agent::AgentConfig;
use crate::core::error::AgentError;
use crate::core::state::WorkerSnapshot;
use crate::core::supervisor::{WorkerCommand, WorkerHandle, WorkerId, WorkerInfo, WorkerSupervisor};
use crate::core::validation::{
    AutoApproveHandler, Decision, DecisionReply, ValidationHandler, ValidationRequest,
};
use crate::core::worker::WorkerContext;
use crate::llm::LlmClient;
use crate::react::{ProgressEvent, WorkerEvent};

/// 进度广播的缓冲条数，慢订阅者超出后会丢最旧的事件
const PROGRESS_CAPACITY: usize = 256;

/// 等待时限
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorSettings {
    pub task_timeout: Duration,
    pub sub_agent_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(600),
            sub_agent_timeout: Duration::from_secs(300),
        }
    }
}

/// run_task 的票据，超时后只撤销属于自己的那次任务
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
struct TaskTicket(u64);

static NEXT_TICKET: AtomicU64 = AtomicU64::new(0);

impl TaskTicket {
    fn next() -> Self {
        Self(NEXT_TICKET.fetch_add(1, Ordering::Relaxed))
    }
}

/// 发往编排循环的消息
enum OrchestratorMessage {
    RunTask {
        ticket: TaskTicket,
        task: String,
        reply: oneshot::Sender<Result<String, AgentError>>,
    },
    /// 调用方等待超时
    AbortTask {
        ticket: TaskTicket,
    },
    StartSubAgent {
        id: WorkerId,
        config: Arc<AgentConfig>,
        task: String,
        reply: oneshot::Sender<String>,
    },
    AbandonSubAgent {
        id: WorkerId,
    },
    Decision {
        worker: WorkerId,
        decision: Decision,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// 句柄之间共享、不影响循环生命周期的部分
#[derive(Clone)]
struct Shared {
    progress: broadcast::Sender<ProgressEvent>,
    supervisor: WorkerSupervisor,
    settings: OrchestratorSettings,
}

/// 可 Clone 的 Orchestrator 句柄；全部句柄释放后编排循环停止所有 Worker 并退出
#[derive(Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::UnboundedSender<OrchestratorMessage>,
    shared: Shared,
}

/// 不延长 Orchestrator 生命周期的引用（Worker、子智能体工具、DecisionReply 持有）
#[derive(Clone, Default)]
pub struct WeakOrchestrator {
    inner: Option<(mpsc::WeakUnboundedSender<OrchestratorMessage>, Shared)>,
}

impl WeakOrchestrator {
    /// 不指向任何 Orchestrator（单独运行 Worker 时使用）
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn upgrade(&self) -> Option<OrchestratorHandle> {
        let (tx, shared) = self.inner.as_ref()?;
        Some(OrchestratorHandle {
            tx: tx.upgrade()?,
            shared: shared.clone(),
        })
    }
}

/// Orchestrator 构建器
pub struct Orchestrator {
    config: AgentConfig,
    llm: Arc<dyn LlmClient>,
    handler: Arc<dyn ValidationHandler>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    /// 未指定处理器时默认全部放行
    pub fn new(config: AgentConfig, llm: Arc<dyn LlmClient>) -> Self {
        Self {
            config,
            llm,
            handler: Arc::new(AutoApproveHandler),
            settings: OrchestratorSettings::default(),
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn ValidationHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// 启动编排循环（需在 tokio 运行时内调用）；主 Worker 在第一次 run_task 时才创建
    pub fn start(self) -> Result<OrchestratorHandle, AgentError> {
        self.config.validate().map_err(AgentError::StartFailed)?;

        let (tx, commands) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (progress, _) = broadcast::channel(PROGRESS_CAPACITY);
        let shared = Shared {
            progress,
            supervisor: WorkerSupervisor::new(),
            settings: self.settings,
        };
        let weak = WeakOrchestrator {
            inner: Some((tx.downgrade(), shared.clone())),
        };

        let event_loop = OrchestratorLoop {
            config: Arc::new(self.config),
            llm: self.llm,
            handler: self.handler,
            shared: shared.clone(),
            weak,
            events_tx,
            main: None,
            pending: None,
            snapshot: None,
            sub_agents: HashMap::new(),
            awaiting_validation: HashSet::new(),
        };
        tokio::spawn(event_loop.run(commands, events));
        tracing::info!("Orchestrator started");

        Ok(OrchestratorHandle { tx, shared })
    }
}

impl OrchestratorHandle {
    /// 运行一个任务并等待其结果（使用配置的任务时限）
    pub async fn run_task(&self, task: impl Into<String>) -> Result<String, AgentError> {
        self.run_task_with_timeout(task, self.shared.settings.task_timeout)
            .await
    }

    /// 超时后返回 Timeout，并让主 Worker 停止
    pub async fn run_task_with_timeout(
        &self,
        task: impl Into<String>,
        timeout: Duration,
    ) -> Result<String, AgentError> {
        let ticket = TaskTicket::next();
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(OrchestratorMessage::RunTask {
                ticket,
                task: task.into(),
                reply,
            })
            .map_err(|_| AgentError::OrchestratorStopped)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AgentError::OrchestratorStopped),
            Err(_) => {
                let _ = self.tx.send(OrchestratorMessage::AbortTask { ticket });
                Err(AgentError::Timeout(timeout))
            }
        }
    }

    /// 启动子智能体并等待它自己的结果；任何失败都以 "Error: ..." 字符串返回
    pub async fn track_sub_agent(
        &self,
        config: Arc<AgentConfig>,
        task: String,
        timeout: Duration,
    ) -> String {
        let id = WorkerId::new();
        let name = config.name.clone();
        let (reply, rx) = oneshot::channel();
        let sent = self.tx.send(OrchestratorMessage::StartSubAgent {
            id,
            config,
            task,
            reply,
        });
        if sent.is_err() {
            return format!("Error: sub-agent '{}' could not start: orchestrator stopped", name);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(_)) => format!("Error: sub-agent '{}' was stopped before answering", name),
            Err(_) => {
                let _ = self.tx.send(OrchestratorMessage::AbandonSubAgent { id });
                format!(
                    "Error: sub-agent '{}' timed out after {:.1}s",
                    name,
                    timeout.as_secs_f64()
                )
            }
        }
    }

    /// 向正在等待校验的 Worker 交付决定；该 Worker 没有待决请求时决定被丢弃
    pub fn submit_decision(&self, worker: WorkerId, decision: Decision) -> Result<(), AgentError> {
        self.tx
            .send(OrchestratorMessage::Decision { worker, decision })
            .map_err(|_| AgentError::OrchestratorStopped)
    }

    /// 订阅所有 Worker（含子智能体）的过程事件
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.shared.progress.subscribe()
    }

    pub async fn active_workers(&self) -> Vec<WorkerInfo> {
        self.shared.supervisor.list().await
    }

    pub async fn worker_count(&self) -> usize {
        self.shared.supervisor.count().await
    }

    /// 停止主 Worker 与所有子智能体，之后的调用返回 OrchestratorStopped
    pub async fn stop(&self) -> Result<(), AgentError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(OrchestratorMessage::Stop { reply })
            .map_err(|_| AgentError::OrchestratorStopped)?;
        rx.await.map_err(|_| AgentError::OrchestratorStopped)
    }
}

struct PendingTask {
    ticket: TaskTicket,
    reply: oneshot::Sender<Result<String, AgentError>>,
}

/// 子智能体跟踪条目
struct SubAgentEntry {
    handle: WorkerHandle,
    reply: oneshot::Sender<String>,
}

struct OrchestratorLoop {
    config: Arc<AgentConfig>,
    llm: Arc<dyn LlmClient>,
    handler: Arc<dyn ValidationHandler>,
    shared: Shared,
    weak: WeakOrchestrator,
    /// 交给每个 Worker 的通知发送端
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    main: Option<WorkerHandle>,
    pending: Option<PendingTask>,
    /// 主 Worker 最近一次完成任务时的状态，用于重建
    snapshot: Option<WorkerSnapshot>,
    sub_agents: HashMap<WorkerId, SubAgentEntry>,
    awaiting_validation: HashSet<WorkerId>,
}

impl OrchestratorLoop {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<OrchestratorMessage>,
        mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    ) {
        loop {
            tokio::select! {
                message = commands.recv() => {
                    let flow = match message {
                        Some(message) => self.handle_message(message).await,
                        // 所有句柄都已释放
                        None => {
                            self.shutdown().await;
                            ControlFlow::Break(())
                        }
                    };
                    if flow.is_break() {
                        break;
                    }
                }
                Some(event) = events.recv() => self.handle_event(event).await,
            }
        }
        tracing::info!("Orchestrator stopped");
    }

    async fn handle_message(&mut self, message: OrchestratorMessage) -> ControlFlow<()> {
        match message {
            OrchestratorMessage::RunTask {
                ticket,
                task,
                reply,
            } => self.start_task(ticket, task, reply).await,
            OrchestratorMessage::AbortTask { ticket } => {
                if self.pending.as_ref().map(|p| p.ticket) != Some(ticket) {
                    return ControlFlow::Continue(());
                }
                tracing::warn!("Task timed out, stopping main worker and its sub-agents");
                self.pending = None;
                if let Some(main) = self.main.take() {
                    self.awaiting_validation.remove(&main.id);
                    self.shared.supervisor.stop(main.id).await;
                }
                for (id, _) in self.sub_agents.drain() {
                    self.awaiting_validation.remove(&id);
                    self.shared.supervisor.stop(id).await;
                }
            }
            OrchestratorMessage::StartSubAgent {
                id,
                config,
                task,
                reply,
            } => self.start_sub_agent(id, config, task, reply).await,
            OrchestratorMessage::AbandonSubAgent { id } => {
                if let Some(entry) = self.sub_agents.remove(&id) {
                    tracing::warn!(worker = %id, agent = %entry.handle.name, "Sub-agent abandoned after timeout");
                    self.awaiting_validation.remove(&id);
                    self.shared.supervisor.stop(id).await;
                }
            }
            OrchestratorMessage::Decision { worker, decision } => {
                if !self.awaiting_validation.remove(&worker) {
                    tracing::debug!(worker = %worker, "No validation outstanding, decision dropped");
                    return ControlFlow::Continue(());
                }
                match self.handle_of(worker) {
                    Some(handle) => {
                        handle.send(WorkerCommand::Decision(decision));
                    }
                    None => tracing::debug!(worker = %worker, "Worker no longer tracked, decision dropped"),
                }
            }
            OrchestratorMessage::Stop { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn start_task(
        &mut self,
        ticket: TaskTicket,
        task: String,
        reply: oneshot::Sender<Result<String, AgentError>>,
    ) {
        if self.pending.is_some() {
            let _ = reply.send(Err(AgentError::Busy));
            return;
        }

        if self.main.is_none() {
            let ctx = WorkerContext {
                id: WorkerId::new(),
                config: self.config.clone(),
                llm: self.llm.clone(),
                listener: self.events_tx.clone(),
                orchestrator: self.weak.clone(),
                sub_agent_timeout: self.shared.settings.sub_agent_timeout,
                seed: self.snapshot.clone(),
            };
            match self.shared.supervisor.start(ctx).await {
                Ok(handle) => self.main = Some(handle),
                Err(e) => {
                    let _ = reply.send(Err(AgentError::StartFailed(e.to_string())));
                    return;
                }
            }
        }

        let delivered = self
            .main
            .as_ref()
            .map(|main| main.send(WorkerCommand::RunTask(task)))
            .unwrap_or(false);
        if !delivered {
            self.main = None;
            let _ = reply.send(Err(AgentError::WorkerExited(
                "main worker is no longer running".to_string(),
            )));
            return;
        }
        self.pending = Some(PendingTask { ticket, reply });
    }

    async fn start_sub_agent(
        &mut self,
        id: WorkerId,
        config: Arc<AgentConfig>,
        task: String,
        reply: oneshot::Sender<String>,
    ) {
        let name = config.name.clone();
        let ctx = WorkerContext {
            id,
            config,
            llm: self.llm.clone(),
            listener: self.events_tx.clone(),
            orchestrator: self.weak.clone(),
            sub_agent_timeout: self.shared.settings.sub_agent_timeout,
            seed: None,
        };
        let handle = match self.shared.supervisor.start(ctx).await {
            Ok(handle) => handle,
            Err(e) => {
                let _ = reply.send(format!("Error: sub-agent '{}' failed to start: {}", name, e));
                return;
            }
        };
        if !handle.send(WorkerCommand::RunTask(task)) {
            let _ = reply.send(format!("Error: sub-agent '{}' exited before starting", name));
            return;
        }
        tracing::info!(worker = %id, agent = %name, "Sub-agent started");
        self.sub_agents.insert(id, SubAgentEntry { handle, reply });
    }

    async fn handle_event(&mut self, event: WorkerEvent) {
        let _ = self.shared.progress.send(event.to_progress());

        match event {
            WorkerEvent::Started { .. } | WorkerEvent::Progress(_) => {}
            WorkerEvent::PendingValidation {
                worker,
                agent,
                step,
                thought,
                code,
            } => {
                if self.handle_of(worker).is_none() {
                    tracing::debug!(worker = %worker, "Validation request from untracked worker ignored");
                    return;
                }
                if !self.awaiting_validation.insert(worker) {
                    tracing::warn!(worker = %worker, "Validation already outstanding, request ignored");
                    return;
                }
                let request = ValidationRequest {
                    worker,
                    agent,
                    step,
                    thought,
                    code,
                };
                let reply = DecisionReply::new(worker, self.weak.clone());
                let handler = self.handler.clone();
                // 处理器可能阻塞（终端输入、二次模型调用），不能占用编排循环
                tokio::spawn(async move {
                    handler.validate(request, reply).await;
                });
            }
            WorkerEvent::FinalResult {
                worker,
                answer,
                snapshot,
            } => {
                if self.is_main(worker) {
                    self.snapshot = Some(snapshot);
                    self.reply_main(Ok(answer));
                } else {
                    self.reply_sub_agent(worker, |_| answer).await;
                }
            }
            WorkerEvent::Error {
                worker,
                reason,
                snapshot,
            } => {
                if self.is_main(worker) {
                    self.snapshot = Some(snapshot);
                    self.reply_main(Err(AgentError::TaskFailed(reason)));
                } else {
                    self.reply_sub_agent(worker, |name| {
                        format!("Error: sub-agent '{}' failed: {}", name, reason)
                    })
                    .await;
                }
            }
            WorkerEvent::Rejected { worker, snapshot } => {
                if self.is_main(worker) {
                    self.snapshot = Some(snapshot);
                    self.reply_main(Err(AgentError::Rejected));
                } else {
                    self.reply_sub_agent(worker, |name| {
                        format!("Error: sub-agent '{}' was rejected by validation", name)
                    })
                    .await;
                }
            }
            WorkerEvent::Exited { worker, reason } => {
                self.awaiting_validation.remove(&worker);
                let reason = reason.unwrap_or_else(|| "stopped".to_string());
                if self.is_main(worker) {
                    self.main = None;
                    self.reply_main(Err(AgentError::WorkerExited(reason)));
                } else if let Some(entry) = self.sub_agents.remove(&worker) {
                    let _ = entry.reply.send(format!(
                        "Error: sub-agent '{}' exited unexpectedly: {}",
                        entry.handle.name, reason
                    ));
                }
            }
        }
    }

    fn is_main(&self, worker: WorkerId) -> bool {
        self.main.as_ref().map(|m| m.id) == Some(worker)
    }

    fn handle_of(&self, worker: WorkerId) -> Option<&WorkerHandle> {
        match &self.main {
            Some(main) if main.id == worker => Some(main),
            _ => self.sub_agents.get(&worker).map(|entry| &entry.handle),
        }
    }

    fn reply_main(&mut self, result: Result<String, AgentError>) {
        match self.pending.take() {
            Some(pending) => {
                let _ = pending.reply.send(result);
            }
            None => tracing::debug!("Main worker outcome with no pending caller, dropped"),
        }
    }

    /// 回复子智能体的调用方并停止该子 Worker；条目不存在（已超时放弃）时丢弃
    async fn reply_sub_agent(&mut self, worker: WorkerId, message: impl FnOnce(&str) -> String) {
        self.awaiting_validation.remove(&worker);
        match self.sub_agents.remove(&worker) {
            Some(entry) => {
                let _ = entry.reply.send(message(&entry.handle.name));
                self.shared.supervisor.stop(worker).await;
            }
            None => tracing::debug!(worker = %worker, "Outcome from untracked sub-agent dropped"),
        }
    }

    async fn shutdown(&mut self) {
        if let Some(pending) = self.pending.take() {
            let _ = pending.reply.send(Err(AgentError::OrchestratorStopped));
        }
        self.main = None;
        self.sub_agents.clear();
        self.awaiting_validation.clear();
        self.shared.supervisor.stop_all().await;
    }
}
