//! Agent 错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 AgentError 决定 FeedBack（交回模型）/ EndTurn（降级结束本轮）/ Propagate。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pool::{PoolError, ResourceKind};

/// 运行过程中可能出现的错误（后端、工具、资源池、迭代上限、超时等）
#[derive(Error, Debug, Clone)]
pub enum AgentError {
    /// 可重试的后端错误（网络、限流、5xx）
    #[error("Transient backend error: {0}")]
    TransientBackend(String),

    /// 不可重试的后端错误（请求格式错误、鉴权失败）
    #[error("Permanent backend error: {0}")]
    PermanentBackend(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Tool execution failed: {0}")]
    ToolExecution(String),

    #[error("Pool exhausted: {0}")]
    PoolExhausted(ResourceKind),

    #[error("Pool startup failed for {kind}: {reason}")]
    PoolStartupFailed { kind: ResourceKind, reason: String },

    #[error("Iteration bound exceeded ({0})")]
    IterationBoundExceeded(usize),

    #[error("Timeout: {0}")]
    Timeout(String),

    /// 整轮期限耗尽，本轮不再继续
    #[error("Turn deadline reached")]
    TurnDeadline,

    /// 进程正在关闭，不再接受新的请求
    #[error("Shutting down")]
    ShuttingDown,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl AgentError {
    /// 对应的结构化错误类别（写入元数据，供运维定位）
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::TransientBackend(_) => ErrorKind::TransientBackendError,
            AgentError::PermanentBackend(_) => ErrorKind::PermanentBackendError,
            AgentError::UnknownTool(_) => ErrorKind::UnknownTool,
            AgentError::ToolExecution(_) => ErrorKind::ToolExecutionError,
            AgentError::PoolExhausted(_) => ErrorKind::PoolExhausted,
            AgentError::PoolStartupFailed { .. } => ErrorKind::PoolStartupFailed,
            AgentError::IterationBoundExceeded(_) => ErrorKind::IterationBoundExceeded,
            AgentError::Timeout(_) | AgentError::TurnDeadline => ErrorKind::Timeout,
            AgentError::ShuttingDown => ErrorKind::ShuttingDown,
            AgentError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            AgentError::Config(_) => ErrorKind::Config,
        }
    }

    /// 是否属于可重试的瞬时错误
    pub fn is_transient(&self) -> bool {
        matches!(self, AgentError::TransientBackend(_) | AgentError::Timeout(_))
    }
}

impl From<PoolError> for AgentError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Exhausted(kind) => AgentError::PoolExhausted(kind),
            PoolError::StartupFailed { kind, reason } => {
                AgentError::PoolStartupFailed { kind, reason }
            }
            PoolError::StartupTimedOut { kind, waited_ms } => AgentError::Timeout(format!(
                "{kind} engine did not become ready within {waited_ms}ms"
            )),
            PoolError::ShutDown => AgentError::ShuttingDown,
            PoolError::UnknownKind(kind) => {
                AgentError::Config(format!("no engine registered for {kind}"))
            }
            PoolError::Session(msg) => AgentError::ToolExecution(msg),
        }
    }
}

/// 错误类别（序列化进 ActionResult / TurnResponse 元数据）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    TransientBackendError,
    PermanentBackendError,
    UnknownTool,
    ToolExecutionError,
    InvalidArguments,
    PoolExhausted,
    PoolStartupFailed,
    IterationBoundExceeded,
    Timeout,
    ShuttingDown,
    InvalidRequest,
    Config,
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 作为工具结果交回模型，由模型决定重试、换工具或向用户解释
    FeedBack(String),
    /// 以降级但格式完整的回答结束本轮
    EndTurn(String),
    /// 不可恢复，直接返回给调用方
    Propagate,
}
