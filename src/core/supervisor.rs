//! Worker 监管：启动、停止、列举
//!
//! 每个 Worker 跑在独立的 tokio 任务里，由一个监视任务等待其 JoinHandle：
//! Worker panic 只会结束它自己的任务，监视任务把 panic 信息转成 Exited 通知发给监听者，
//! 不影响 Supervisor 与其他 Worker。崩溃后不会自动重启，是否重建由 Orchestrator 决定。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::validation::Decision;
use crate::core::worker::{Worker, WorkerContext};
use crate::react::WorkerEvent;

/// Worker 句柄 id
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(Uuid);

impl WorkerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // 日志里短 id 足够区分
        let s = self.0.simple().to_string();
        write!(f, "{}", &s[..8])
    }
}

/// 发给 Worker 的命令
#[derive(Debug, Clone)]
pub enum WorkerCommand {
    RunTask(String),
    /// 对当前待校验步骤的决定
    Decision(Decision),
    Stop,
}

/// 已启动 Worker 的句柄：命令通道 + 取消令牌
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub id: WorkerId,
    pub name: String,
    commands: mpsc::UnboundedSender<WorkerCommand>,
    cancel: CancellationToken,
}

impl WorkerHandle {
    /// Worker 已退出时返回 false
    pub fn send(&self, command: WorkerCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    fn stop(&self) {
        self.cancel.cancel();
        let _ = self.commands.send(WorkerCommand::Stop);
    }
}

/// list() 的返回项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub name: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("invalid agent config: {0}")]
    InvalidConfig(String),

    #[error("supervisor is shutting down")]
    ShuttingDown,
}

/// Worker 监管者（可 Clone，内部共享同一张表）
#[derive(Clone, Default)]
pub struct WorkerSupervisor {
    workers: Arc<RwLock<HashMap<WorkerId, WorkerHandle>>>,
    /// 根令牌：所有 Worker 的令牌都是它的子令牌
    shutdown: CancellationToken,
}

impl WorkerSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 启动一个 Worker；配置非法或正在关闭时返回错误
    pub async fn start(&self, ctx: WorkerContext) -> Result<WorkerHandle, SupervisorError> {
        if self.shutdown.is_cancelled() {
            return Err(SupervisorError::ShuttingDown);
        }
        ctx.config
            .validate()
            .map_err(SupervisorError::InvalidConfig)?;

        let id = ctx.id;
        let name = ctx.config.name.clone();
        let listener = ctx.listener.clone();
        let cancel = self.shutdown.child_token();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = WorkerHandle {
            id,
            name: name.clone(),
            commands: tx,
            cancel: cancel.clone(),
        };

        // 先登记再启动，监视任务的移除一定发生在登记之后
        self.workers.write().await.insert(id, handle.clone());

        let worker = Worker::new(ctx, rx, cancel);
        let join = tokio::spawn(worker.run());
        tracing::info!(worker = %id, agent = %name, "Worker started");

        let workers = self.workers.clone();
        tokio::spawn(async move {
            let reason = match join.await {
                Ok(()) => None,
                Err(e) if e.is_panic() => Some(format!("worker panicked: {}", panic_message(e.into_panic()))),
                Err(_) => Some("worker task cancelled".to_string()),
            };
            workers.write().await.remove(&id);
            match &reason {
                Some(r) => tracing::error!(worker = %id, agent = %name, reason = %r, "Worker exited abnormally"),
                None => tracing::debug!(worker = %id, agent = %name, "Worker exited"),
            }
            let _ = listener.send(WorkerEvent::Exited { worker: id, reason });
        });

        Ok(handle)
    }

    /// 停止指定 Worker；不存在时返回 false
    pub async fn stop(&self, id: WorkerId) -> bool {
        match self.workers.read().await.get(&id) {
            Some(handle) => {
                handle.stop();
                true
            }
            None => false,
        }
    }

    /// 停止全部 Worker，之后不再接受 start
    pub async fn stop_all(&self) {
        self.shutdown.cancel();
        for handle in self.workers.read().await.values() {
            handle.stop();
        }
    }

    pub async fn list(&self) -> Vec<WorkerInfo> {
        let mut infos: Vec<WorkerInfo> = self
            .workers
            .read()
            .await
            .values()
            .map(|h| WorkerInfo {
                id: h.id,
                name: h.name.clone(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        infos
    }

    pub async fn count(&self) -> usize {
        self.workers.read().await.len()
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::agent::AgentConfig;
    use crate::core::orchestrator::WeakOrchestrator;
    use crate::llm::MockLlmClient;

    fn context(config: AgentConfig, listener: mpsc::UnboundedSender<WorkerEvent>) -> WorkerContext {
        WorkerContext {
            id: WorkerId::new(),
            config: Arc::new(config),
            llm: Arc::new(MockLlmClient),
            listener,
            orchestrator: WeakOrchestrator::detached(),
            sub_agent_timeout: Duration::from_secs(5),
            seed: None,
        }
    }

    #[tokio::test]
    async fn test_start_list_stop() {
        let supervisor = WorkerSupervisor::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = supervisor
            .start(context(AgentConfig::new("alpha"), tx))
            .await
            .unwrap();
        assert_eq!(supervisor.count().await, 1);
        assert_eq!(supervisor.list().await[0].name, "alpha");

        assert!(supervisor.stop(handle.id).await);
        // Started 之后一定能收到 Exited
        loop {
            match rx.recv().await.unwrap() {
                WorkerEvent::Exited { worker, reason } => {
                    assert_eq!(worker, handle.id);
                    assert!(reason.is_none());
                    break;
                }
                _ => continue,
            }
        }
        assert_eq!(supervisor.count().await, 0);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let supervisor = WorkerSupervisor::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = supervisor
            .start(context(AgentConfig::new("bad name"), tx))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidConfig(_)));
        assert_eq!(supervisor.count().await, 0);
    }

    #[tokio::test]
    async fn test_no_start_after_stop_all() {
        let supervisor = WorkerSupervisor::new();
        supervisor.stop_all().await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = supervisor
            .start(context(AgentConfig::new("late"), tx))
            .await
            .unwrap_err();
        assert_eq!(err, SupervisorError::ShuttingDown);
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
        assert_eq!(panic_message(Box::new(42)), "unknown panic");
    }
}
