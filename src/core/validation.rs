//! 校验关卡：每个代码步骤执行前的 approve / modify / feedback / reject
//!
//! Orchestrator 对每个 ValidationRequest 恰好调用一次 ValidationHandler::validate，
//! 并给它一个 DecisionReply；处理器负责最终通过 reply 交回一个 Decision（可以稍后、在别的任务里）。
//! reply 被丢弃而没有发送时自动交回 Reject，Worker 不会无限等待。
//!
//! 内置处理器：
//! - AutoApproveHandler：全部放行
//! - InteractiveHandler：终端交互（y/n、m 修改代码、f 反馈）
//! - ChannelHandler：把请求转给外部（UI）异步作答
//! - AiJudgeHandler：二次模型调用打分，达到阈值才放行

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::config::ValidationSection;
use crate::core::orchestrator::WeakOrchestrator;
use crate::core::supervisor::WorkerId;
use crate::llm::{CompletionRequest, LlmClient, ModelOptions};
use crate::memory::Message;
use crate::react::planner::extract_json;

/// 一次待校验的代码步骤
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationRequest {
    pub worker: WorkerId,
    /// 发起请求的智能体名称
    pub agent: String,
    pub step: usize,
    pub thought: String,
    pub code: String,
}

/// 处理器给出的决定
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Approve,
    /// 用新代码替换后执行
    Modify(String),
    /// 不执行，把消息作为错误步骤反馈给模型
    Feedback(String),
    Reject,
}

impl Decision {
    pub fn label(&self) -> &'static str {
        match self {
            Decision::Approve => "approve",
            Decision::Modify(_) => "modify",
            Decision::Feedback(_) => "feedback",
            Decision::Reject => "reject",
        }
    }
}

enum ReplyTarget {
    Orchestrator(WeakOrchestrator),
    Channel(oneshot::Sender<Decision>),
}

/// 交回决定的一次性凭证
pub struct DecisionReply {
    worker: WorkerId,
    target: Option<ReplyTarget>,
}

impl DecisionReply {
    pub(crate) fn new(worker: WorkerId, orchestrator: WeakOrchestrator) -> Self {
        Self {
            worker,
            target: Some(ReplyTarget::Orchestrator(orchestrator)),
        }
    }

    /// 不经过 Orchestrator 的凭证：决定写入返回的 oneshot（组合处理器或测试用）
    pub fn pair(worker: WorkerId) -> (Self, oneshot::Receiver<Decision>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                worker,
                target: Some(ReplyTarget::Channel(tx)),
            },
            rx,
        )
    }

    pub fn send(mut self, decision: Decision) {
        self.deliver(decision);
    }

    fn deliver(&mut self, decision: Decision) {
        match self.target.take() {
            Some(ReplyTarget::Orchestrator(weak)) => match weak.upgrade() {
                Some(orchestrator) => {
                    if let Err(e) = orchestrator.submit_decision(self.worker, decision) {
                        tracing::debug!(worker = %self.worker, "Decision not delivered: {}", e);
                    }
                }
                None => tracing::debug!(worker = %self.worker, "Orchestrator gone, decision dropped"),
            },
            Some(ReplyTarget::Channel(tx)) => {
                let _ = tx.send(decision);
            }
            None => {}
        }
    }
}

impl Drop for DecisionReply {
    fn drop(&mut self) {
        if self.target.is_some() {
            tracing::warn!(worker = %self.worker, "Validation reply dropped without a decision, rejecting");
            self.deliver(Decision::Reject);
        }
    }
}

/// 校验处理器
#[async_trait]
pub trait ValidationHandler: Send + Sync {
    async fn validate(&self, request: ValidationRequest, reply: DecisionReply);
}

/// 全部放行（默认）
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoApproveHandler;

#[async_trait]
impl ValidationHandler for AutoApproveHandler {
    async fn validate(&self, _request: ValidationRequest, reply: DecisionReply) {
        reply.send(Decision::Approve);
    }
}

/// 终端交互：展示思考与代码，等待人工决定
///
/// 多个 Worker 的请求按到达顺序排队，同一时刻只占用一次终端。输入结束（EOF）视为拒绝。
pub struct InteractiveHandler<R, W> {
    io: Mutex<(R, W)>,
}

impl InteractiveHandler<BufReader<tokio::io::Stdin>, tokio::io::Stdout> {
    pub fn stdio() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
    }
}

impl<R, W> InteractiveHandler<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            io: Mutex::new((reader, writer)),
        }
    }

    async fn ask(&self, request: &ValidationRequest) -> std::io::Result<Decision> {
        let mut io = self.io.lock().await;
        let (reader, writer) = &mut *io;
        let banner = format!(
            "\n📋 [{}] step {} wants to run:\nThought: {}\n```\n{}\n```\n",
            request.agent, request.step, request.thought, request.code
        );
        writer.write_all(banner.as_bytes()).await?;

        loop {
            writer
                .write_all(b"[y] approve / [n] reject / [m <code>] modify / [f <message>] feedback: ")
                .await?;
            writer.flush().await?;

            let mut line = String::new();
            if reader.read_line(&mut line).await? == 0 {
                return Ok(Decision::Reject);
            }
            match parse_answer(&line) {
                Some(Answer::Decided(decision)) => return Ok(decision),
                Some(Answer::ModifyMultiline) => {
                    writer
                        .write_all(b"Enter replacement code, finish with a single '.' line:\n")
                        .await?;
                    writer.flush().await?;
                    let mut code = Vec::new();
                    loop {
                        let mut line = String::new();
                        if reader.read_line(&mut line).await? == 0 {
                            break;
                        }
                        let line = line.trim_end_matches(['\r', '\n']);
                        if line == "." {
                            break;
                        }
                        code.push(line.to_string());
                    }
                    return Ok(Decision::Modify(code.join("\n")));
                }
                None => writer.write_all(b"Unrecognized input.\n").await?,
            }
        }
    }
}

#[async_trait]
impl<R, W> ValidationHandler for InteractiveHandler<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn validate(&self, request: ValidationRequest, reply: DecisionReply) {
        let decision = match self.ask(&request).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!(worker = %request.worker, "Interactive validation failed: {}, rejecting", e);
                Decision::Reject
            }
        };
        reply.send(decision);
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Answer {
    Decided(Decision),
    /// 单独的 m：接下来多行输入新代码
    ModifyMultiline,
}

fn parse_answer(line: &str) -> Option<Answer> {
    let line = line.trim();
    let (head, rest) = match line.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (line, ""),
    };
    match head.to_lowercase().as_str() {
        "y" | "yes" | "a" | "approve" | "是" => Some(Answer::Decided(Decision::Approve)),
        "n" | "no" | "r" | "reject" | "否" => Some(Answer::Decided(Decision::Reject)),
        "m" | "modify" if rest.is_empty() => Some(Answer::ModifyMultiline),
        "m" | "modify" => Some(Answer::Decided(Decision::Modify(rest.to_string()))),
        "f" | "feedback" if !rest.is_empty() => {
            Some(Answer::Decided(Decision::Feedback(rest.to_string())))
        }
        _ => None,
    }
}

/// 把请求转交给外部消费者（如 UI），由其稍后通过 DecisionReply 作答
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<(ValidationRequest, DecisionReply)>,
}

impl ChannelHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(ValidationRequest, DecisionReply)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ValidationHandler for ChannelHandler {
    async fn validate(&self, request: ValidationRequest, reply: DecisionReply) {
        // 消费者已关闭时 reply 随 SendError 一起被丢弃，自动拒绝
        if self.tx.send((request, reply)).is_err() {
            tracing::warn!("Validation consumer closed, step rejected");
        }
    }
}

const JUDGE_PROMPT: &str = "You are a code safety reviewer for an autonomous agent. \
The agent wants to execute the code below in a sandbox that can call tools and sub-agents. \
Judge whether it is safe and sensible for the stated thought. \
Reply with JSON only: {\"decision\": \"approve\" | \"reject\" | \"modify\" | \"feedback\", \
\"score\": 0-10 (10 = certainly safe and correct), \"reason\": \"...\", \
\"modified_code\": \"...\" (only for modify)}.";

/// 评审模型的结论
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum JudgeDecision {
    Approve,
    Reject,
    Modify,
    Feedback,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, JsonSchema)]
pub struct JudgeVerdict {
    pub decision: JudgeDecision,
    /// 0-10，越高越有把握
    pub score: u8,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub modified_code: Option<String>,
}

impl JudgeVerdict {
    /// 转为 Decision；None 表示低于阈值的放行，需要升级处理
    pub fn into_decision(self, threshold: u8) -> Option<Decision> {
        match self.decision {
            JudgeDecision::Approve if self.score >= threshold => Some(Decision::Approve),
            JudgeDecision::Approve => None,
            JudgeDecision::Reject => Some(Decision::Reject),
            JudgeDecision::Modify => match self.modified_code {
                Some(code) if !code.trim().is_empty() => Some(Decision::Modify(code)),
                _ => Some(Decision::Feedback(self.reason)),
            },
            JudgeDecision::Feedback => Some(Decision::Feedback(self.reason)),
        }
    }
}

/// 模型评审：二次模型调用打分，score >= threshold 的 approve 才自动放行
///
/// 低于阈值或评审本身失败时交给 fallback（如 InteractiveHandler）；没有 fallback 则转为 feedback，
/// 让智能体重写这一步。
pub struct AiJudgeHandler {
    llm: Arc<dyn LlmClient>,
    model: String,
    threshold: u8,
    options: ModelOptions,
    fallback: Option<Arc<dyn ValidationHandler>>,
    schema: Value,
}

impl AiJudgeHandler {
    pub fn new(llm: Arc<dyn LlmClient>, model: impl Into<String>, threshold: u8) -> Self {
        let schema = serde_json::to_value(schemars::schema_for!(JudgeVerdict)).unwrap_or(Value::Null);
        Self {
            llm,
            model: model.into(),
            threshold: threshold.min(10),
            options: ModelOptions {
                temperature: Some(0.0),
            },
            fallback: None,
            schema,
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn ValidationHandler>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    async fn judge(&self, request: &ValidationRequest) -> Result<JudgeVerdict, String> {
        let messages = vec![
            Message::system(JUDGE_PROMPT),
            Message::user(format!(
                "Agent: {}\nStep: {}\nThought: {}\nCode:\n```\n{}\n```",
                request.agent, request.step, request.thought, request.code
            )),
        ];
        let raw = self
            .llm
            .complete(CompletionRequest {
                model: &self.model,
                messages: &messages,
                response_schema: &self.schema,
                options: &self.options,
            })
            .await
            .map_err(|e| e.to_string())?;
        let json = extract_json(&raw).ok_or_else(|| format!("no JSON in judge reply: {}", raw))?;
        serde_json::from_str(json).map_err(|e| format!("{}: {}", e, json))
    }

    async fn escalate(&self, request: ValidationRequest, reply: DecisionReply, reason: String) {
        match &self.fallback {
            Some(fallback) => fallback.validate(request, reply).await,
            None => reply.send(Decision::Feedback(reason)),
        }
    }
}

#[async_trait]
impl ValidationHandler for AiJudgeHandler {
    async fn validate(&self, request: ValidationRequest, reply: DecisionReply) {
        match self.judge(&request).await {
            Ok(verdict) => {
                let score = verdict.score;
                let reason = verdict.reason.clone();
                match verdict.into_decision(self.threshold) {
                    Some(decision) => {
                        tracing::info!(
                            worker = %request.worker,
                            decision = decision.label(),
                            score,
                            "Judge verdict"
                        );
                        reply.send(decision);
                    }
                    None => {
                        tracing::info!(worker = %request.worker, score, threshold = self.threshold, "Judge not confident, escalating");
                        let reason = format!(
                            "Reviewer is not confident this step is safe (score {}/10): {}. Make the code simpler and more explicit.",
                            score, reason
                        );
                        self.escalate(request, reply, reason).await;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(worker = %request.worker, "Judge failed: {}", e);
                let reason = format!("The safety reviewer could not evaluate this step ({}). Restate the code more simply.", e);
                self.escalate(request, reply, reason).await;
            }
        }
    }
}

/// 配置中的校验方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    #[default]
    Auto,
    Interactive,
    Judge,
}

/// 根据 [validation] 段创建处理器；judge 模式复用主模型客户端
pub fn handler_from_config(
    section: &ValidationSection,
    llm: Arc<dyn LlmClient>,
    default_model: &str,
) -> Arc<dyn ValidationHandler> {
    match section.mode {
        ValidationMode::Auto => Arc::new(AutoApproveHandler),
        ValidationMode::Interactive => Arc::new(InteractiveHandler::stdio()),
        ValidationMode::Judge => {
            let model = section.judge_model.as_deref().unwrap_or(default_model);
            tracing::info!("Validation by AI judge ({}, threshold {})", model, section.approve_threshold);
            Arc::new(AiJudgeHandler::new(llm, model, section.approve_threshold))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, ScriptedLlmClient};

    fn request() -> ValidationRequest {
        ValidationRequest {
            worker: WorkerId::new(),
            agent: "main".to_string(),
            step: 1,
            thought: "add".to_string(),
            code: "x = 1 + 1".to_string(),
        }
    }

    #[test]
    fn test_parse_answer() {
        assert_eq!(parse_answer("y\n"), Some(Answer::Decided(Decision::Approve)));
        assert_eq!(parse_answer(" Reject "), Some(Answer::Decided(Decision::Reject)));
        assert_eq!(
            parse_answer("m x = 2"),
            Some(Answer::Decided(Decision::Modify("x = 2".to_string())))
        );
        assert_eq!(parse_answer("m"), Some(Answer::ModifyMultiline));
        assert_eq!(
            parse_answer("f use the echo tool"),
            Some(Answer::Decided(Decision::Feedback("use the echo tool".to_string())))
        );
        assert_eq!(parse_answer("f"), None);
        assert_eq!(parse_answer("maybe"), None);
    }

    #[tokio::test]
    async fn test_interactive_reads_decisions() {
        let input: &[u8] = b"what\nm\ny = 3\nz = y * 2\n.\n";
        let handler = InteractiveHandler::new(input, Vec::new());
        let (reply, rx) = DecisionReply::pair(WorkerId::new());
        handler.validate(request(), reply).await;
        assert_eq!(rx.await.unwrap(), Decision::Modify("y = 3\nz = y * 2".to_string()));

        let output = handler.io.lock().await.1.clone();
        let output = String::from_utf8(output).unwrap();
        assert!(output.contains("[main] step 1 wants to run"));
        assert!(output.contains("Unrecognized input."));
    }

    #[tokio::test]
    async fn test_interactive_eof_rejects() {
        let handler = InteractiveHandler::new(&b""[..], Vec::new());
        let (reply, rx) = DecisionReply::pair(WorkerId::new());
        handler.validate(request(), reply).await;
        assert_eq!(rx.await.unwrap(), Decision::Reject);
    }

    #[tokio::test]
    async fn test_dropped_reply_rejects() {
        let (reply, rx) = DecisionReply::pair(WorkerId::new());
        drop(reply);
        assert_eq!(rx.await.unwrap(), Decision::Reject);
    }

    #[tokio::test]
    async fn test_channel_handler_forwards() {
        let (handler, mut rx) = ChannelHandler::new();
        let (reply, decision_rx) = DecisionReply::pair(WorkerId::new());
        handler.validate(request(), reply).await;
        let (req, reply) = rx.recv().await.unwrap();
        assert_eq!(req.code, "x = 1 + 1");
        reply.send(Decision::Feedback("no".to_string()));
        assert_eq!(decision_rx.await.unwrap(), Decision::Feedback("no".to_string()));
    }

    #[test]
    fn test_verdict_threshold() {
        let verdict = |decision, score| JudgeVerdict {
            decision,
            score,
            reason: "r".to_string(),
            modified_code: None,
        };
        assert_eq!(verdict(JudgeDecision::Approve, 8).into_decision(7), Some(Decision::Approve));
        assert_eq!(verdict(JudgeDecision::Approve, 6).into_decision(7), None);
        assert_eq!(verdict(JudgeDecision::Reject, 10).into_decision(7), Some(Decision::Reject));
        // modify 却没给代码，退化为 feedback
        assert_eq!(
            verdict(JudgeDecision::Modify, 5).into_decision(7),
            Some(Decision::Feedback("r".to_string()))
        );
    }

    #[tokio::test]
    async fn test_judge_handler_decisions() {
        let llm = Arc::new(ScriptedLlmClient::from_results(vec![
            Ok(r#"{"decision": "approve", "score": 9, "reason": "fine"}"#.to_string()),
            Ok(r#"```json
{"decision": "approve", "score": 3, "reason": "unclear"}
```"#
                .to_string()),
            Err(LlmError::Transport("down".to_string())),
        ]));
        let judge = AiJudgeHandler::new(llm, "judge", 7);

        let (reply, rx) = DecisionReply::pair(WorkerId::new());
        judge.validate(request(), reply).await;
        assert_eq!(rx.await.unwrap(), Decision::Approve);

        let (reply, rx) = DecisionReply::pair(WorkerId::new());
        judge.validate(request(), reply).await;
        match rx.await.unwrap() {
            Decision::Feedback(msg) => assert!(msg.contains("score 3/10")),
            other => panic!("expected feedback, got {:?}", other),
        }

        let (reply, rx) = DecisionReply::pair(WorkerId::new());
        judge.validate(request(), reply).await;
        assert!(matches!(rx.await.unwrap(), Decision::Feedback(_)));
    }

    #[tokio::test]
    async fn test_judge_escalates_to_fallback() {
        let llm = Arc::new(ScriptedLlmClient::from_responses([
            r#"{"decision": "approve", "score": 2, "reason": "?"}"#,
        ]));
        let judge = AiJudgeHandler::new(llm, "judge", 7).with_fallback(Arc::new(AutoApproveHandler));
        let (reply, rx) = DecisionReply::pair(WorkerId::new());
        judge.validate(request(), reply).await;
        assert_eq!(rx.await.unwrap(), Decision::Approve);
    }
}
