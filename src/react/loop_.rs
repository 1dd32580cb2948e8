//! 单轮对话状态机
//!
//! Deciding（询问模型）→ Acting（执行请求的动作）→ Deciding … → Done。
//! 迭代上限约束 Acting 的次数，是防止无限工具调用的主要手段；
//! 网关失败、迭代上限、整轮期限都以一条合成的 assistant 消息结束本轮，不向调用方抛错。
//! 可选 event_tx：按顺序推送 TurnStarted / ActionRequested / ActionCompleted / AnswerDelta / AnswerComplete / TurnFailed。

use futures_util::future::join_all;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;

use crate::core::{AgentError, ErrorKind, RecoveryEngine};
use crate::llm::{ModelDecision, ModelGateway};
use crate::memory::{ActionRequest, ActionResult, Conversation, Message};
use crate::react::TurnEvent;
use crate::tools::{truncate_chars, ToolExecutor};

/// 流式回复时每段字符数
const CHUNK_CHARS: usize = 6;
/// ActionCompleted 预览最大字符数
const RESULT_PREVIEW_CHARS: usize = 200;

/// 一轮的执行结果
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub answer: String,
    /// 本轮实际执行的动作（按模型给出的顺序）
    pub actions: Vec<ActionRequest>,
    /// 完成的 Acting 次数
    pub iterations: usize,
    /// 降级结束时的错误类别与内部说明
    pub failure: Option<(ErrorKind, String)>,
}

/// 单轮配置
pub struct TurnSession<'a> {
    pub gateway: &'a ModelGateway,
    pub executor: &'a ToolExecutor,
    pub recovery: &'a RecoveryEngine,
    pub system_prompt: &'a str,
    pub max_iterations: usize,
    /// 无资源冲突时同一批动作并发执行
    pub parallel_actions: bool,
    /// 整轮期限
    pub deadline: Option<Instant>,
    pub event_tx: Option<&'a UnboundedSender<TurnEvent>>,
}

impl<'a> TurnSession<'a> {
    pub fn new(
        gateway: &'a ModelGateway,
        executor: &'a ToolExecutor,
        recovery: &'a RecoveryEngine,
        system_prompt: &'a str,
    ) -> Self {
        Self {
            gateway,
            executor,
            recovery,
            system_prompt,
            max_iterations: 25,
            parallel_actions: false,
            deadline: None,
            event_tx: None,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_parallel_actions(mut self, parallel: bool) -> Self {
        self.parallel_actions = parallel;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_event_tx(mut self, tx: &'a UnboundedSender<TurnEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }
}

enum Phase {
    Deciding,
    Acting(Vec<ActionRequest>),
    Done {
        answer: String,
        failure: Option<(ErrorKind, String)>,
    },
}

fn send_event(tx: &Option<&UnboundedSender<TurnEvent>>, ev: TurnEvent) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}

/// 模型看到的历史：没有 system 消息时在最前面加上系统提示
fn with_system_prompt(prompt: &str, messages: &[Message]) -> Vec<Message> {
    let has_system = messages.iter().any(|m| matches!(m, Message::System { .. }));
    let mut history = Vec::with_capacity(messages.len() + 1);
    if !has_system && !prompt.is_empty() {
        history.push(Message::system(prompt));
    }
    history.extend_from_slice(messages);
    history
}

impl TurnSession<'_> {
    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// 以降级回答结束：合成说明文本，记录类别与内部细节
    fn degrade(&self, err: &AgentError) -> Phase {
        Phase::Done {
            answer: self.recovery.user_message(err),
            failure: Some((err.kind(), err.to_string())),
        }
    }

    async fn run_actions(&self, actions: &[ActionRequest], conversation_id: &str) -> Vec<ActionResult> {
        for action in actions {
            send_event(
                &self.event_tx,
                TurnEvent::ActionRequested {
                    call_id: action.id.clone(),
                    tool: action.name.clone(),
                    args: action.arguments.clone(),
                },
            );
        }

        let concurrent = self.parallel_actions
            && actions.len() > 1
            && !self.executor.has_resource_conflict(actions);
        let results = if concurrent {
            // join_all 保持输入顺序
            join_all(
                actions
                    .iter()
                    .map(|a| self.executor.invoke(a, conversation_id, self.deadline)),
            )
            .await
        } else {
            let mut results = Vec::with_capacity(actions.len());
            for action in actions {
                results.push(self.executor.invoke(action, conversation_id, self.deadline).await);
            }
            results
        };

        for result in &results {
            send_event(
                &self.event_tx,
                TurnEvent::ActionCompleted {
                    call_id: result.call_id.clone(),
                    tool: result.name.clone(),
                    ok: result.is_success(),
                    preview: truncate_chars(&result.content(), RESULT_PREVIEW_CHARS),
                },
            );
        }
        results
    }
}

/// 运行一轮；对话中最后一条应为本轮的 user 消息
pub async fn run_turn(session: &TurnSession<'_>, conversation: &mut Conversation) -> TurnOutcome {
    let conversation_id = conversation.id.clone();
    let tx = session.event_tx;
    send_event(
        &tx,
        TurnEvent::TurnStarted {
            conversation_id: conversation_id.clone(),
        },
    );

    let descriptors = session.executor.descriptors();
    let mut invoked: Vec<ActionRequest> = Vec::new();
    let mut iterations = 0usize;
    let mut step = 0usize;
    let mut phase = Phase::Deciding;

    let (answer, failure) = loop {
        phase = match phase {
            Phase::Deciding => {
                if session.deadline_passed() {
                    tracing::warn!(conversation_id = %conversation_id, step, "turn deadline reached");
                    session.degrade(&AgentError::TurnDeadline)
                } else {
                    step += 1;
                    send_event(
                        &tx,
                        TurnEvent::StepUpdate {
                            step,
                            max_steps: session.max_iterations,
                        },
                    );
                    let history = with_system_prompt(session.system_prompt, conversation.messages());
                    match session
                        .gateway
                        .complete(&history, &descriptors, session.deadline)
                        .await
                    {
                        Ok(ModelDecision::Answer(text)) => Phase::Done {
                            answer: text,
                            failure: None,
                        },
                        Ok(ModelDecision::Actions { content, actions }) => {
                            if iterations >= session.max_iterations {
                                tracing::warn!(
                                    conversation_id = %conversation_id,
                                    max_iterations = session.max_iterations,
                                    "iteration bound reached"
                                );
                                session.degrade(&AgentError::IterationBoundExceeded(
                                    session.max_iterations,
                                ))
                            } else {
                                conversation.push(Message::assistant_with_actions(
                                    content,
                                    actions.clone(),
                                ));
                                Phase::Acting(actions)
                            }
                        }
                        Err(err) if session.deadline_passed() => {
                            tracing::warn!(conversation_id = %conversation_id, error = %err, "turn deadline reached while waiting for the model");
                            session.degrade(&AgentError::TurnDeadline)
                        }
                        Err(err) => {
                            tracing::error!(conversation_id = %conversation_id, error = %err, "model gateway failed");
                            session.degrade(&err)
                        }
                    }
                }
            }
            Phase::Acting(actions) => {
                iterations += 1;
                let results = session.run_actions(&actions, &conversation_id).await;
                for result in results {
                    conversation.push(Message::tool(result));
                }
                invoked.extend(actions);
                Phase::Deciding
            }
            Phase::Done { answer, failure } => break (answer, failure),
        };
    };

    conversation.push(Message::assistant(answer.clone()));

    if let Some((kind, _)) = &failure {
        send_event(
            &tx,
            TurnEvent::TurnFailed {
                kind: *kind,
                message: answer.clone(),
            },
        );
    }
    let chars: Vec<char> = answer.chars().collect();
    for chunk in chars.chunks(CHUNK_CHARS) {
        send_event(
            &tx,
            TurnEvent::AnswerDelta {
                text: chunk.iter().collect(),
            },
        );
    }
    send_event(
        &tx,
        TurnEvent::AnswerComplete {
            answer: answer.clone(),
        },
    );

    tracing::info!(
        conversation_id = %conversation_id,
        iterations,
        actions = invoked.len(),
        failed = failure.is_some(),
        "turn finished"
    );
    TurnOutcome {
        answer,
        actions: invoked,
        iterations,
        failure,
    }
}
