//! 错误恢复引擎
//!
//! 根据 AgentError 类型返回 RecoveryAction：工具级错误交回模型，网关级错误降级结束本轮，
//! 关闭中 / 调用方错误直接上抛。用户只看到自然语言说明，结构化类别走元数据。

use crate::core::{AgentError, RecoveryAction};

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &AgentError) -> RecoveryAction {
        match err {
            AgentError::UnknownTool(name) => RecoveryAction::FeedBack(format!(
                "Tool '{name}' does not exist. Choose one of the available tools or answer directly."
            )),
            AgentError::ToolExecution(msg) => {
                RecoveryAction::FeedBack(format!("Tool failed: {msg}"))
            }
            AgentError::PoolExhausted(kind) => RecoveryAction::FeedBack(format!(
                "The {kind} resource is busy right now. Try again later or use another tool."
            )),
            AgentError::PoolStartupFailed { kind, .. } => RecoveryAction::FeedBack(format!(
                "The {kind} resource could not be started. Use another tool or explain the limitation."
            )),
            AgentError::Timeout(what) => {
                RecoveryAction::FeedBack(format!("Timed out: {what}"))
            }
            AgentError::TurnDeadline => RecoveryAction::EndTurn(
                "Sorry, this request took too long and was stopped before a final answer. \
                 Please try again or narrow the request."
                    .to_string(),
            ),
            AgentError::TransientBackend(_) => RecoveryAction::EndTurn(
                "Sorry, the language model is temporarily unreachable. Please try again in a moment."
                    .to_string(),
            ),
            AgentError::PermanentBackend(_) => RecoveryAction::EndTurn(
                "Sorry, the language model rejected this request, so I could not finish the answer."
                    .to_string(),
            ),
            AgentError::IterationBoundExceeded(max) => RecoveryAction::EndTurn(format!(
                "Max iterations reached ({max}) before a final answer was produced. \
                 Please narrow the request or continue in a new message."
            )),
            AgentError::ShuttingDown
            | AgentError::InvalidRequest(_)
            | AgentError::Config(_) => RecoveryAction::Propagate,
        }
    }

    /// 网关级错误的用户可读说明；不可恢复错误也给出兜底文本
    pub fn user_message(&self, err: &AgentError) -> String {
        match self.handle(err) {
            RecoveryAction::FeedBack(msg) | RecoveryAction::EndTurn(msg) => msg,
            RecoveryAction::Propagate => {
                "Sorry, the service cannot handle this request right now.".to_string()
            }
        }
    }
}
