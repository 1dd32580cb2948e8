//! LLM 客户端抽象
//!
//! 后端契约：请求 = 有序消息 + 可用动作描述；应答 = 文本或有序动作请求。
//! 失败必须区分瞬时（可重试）与永久，网关的重试策略据此决定。

use async_trait::async_trait;
use thiserror::Error;

use crate::core::AgentError;
use crate::memory::Message;
use crate::tools::ToolDescriptor;

/// 发往后端的一次请求
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDescriptor>,
}

/// 后端原生返回的工具调用；arguments 为未解析的 JSON 文本
#[derive(Debug, Clone, PartialEq)]
pub struct RawToolCall {
    pub id: Option<String>,
    pub name: String,
    pub arguments: String,
}

/// 后端原始应答，由网关解析为决策
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendReply {
    pub content: Option<String>,
    pub tool_calls: Vec<RawToolCall>,
}

impl BackendReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn calls(tool_calls: Vec<RawToolCall>) -> Self {
        Self {
            content: None,
            tool_calls,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// 网络、超时、限流、5xx
    #[error("transient: {0}")]
    Transient(String),
    /// 请求格式错误、鉴权失败、无法解码的应答
    #[error("permanent: {0}")]
    Permanent(String),
}

impl From<BackendError> for AgentError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Transient(msg) => AgentError::TransientBackend(msg),
            BackendError::Permanent(msg) => AgentError::PermanentBackend(msg),
        }
    }
}

/// 语言模型后端
#[async_trait]
pub trait LlmClient: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: &ChatRequest) -> Result<BackendReply, BackendError>;

    /// 可达性探测（健康检查用）；默认视为可达
    async fn health_check(&self) -> Result<(), BackendError> {
        Ok(())
    }
}
