//! 模型网关
//!
//! 把历史与可用工具发给后端，按 RetryPolicy 对瞬时错误重试（单次尝试超时也算瞬时），
//! 再把应答解析为「最终回答」或「动作请求列表」。
//! 解析宽容：原生 tool_calls 参数无法解析时降级为纯文本；
//! 不支持原生工具调用的后端可在文本中输出 `{"tool": ..., "args": {...}}`。

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::time::Instant;

use crate::core::{AgentError, RetryPolicy};
use crate::llm::{BackendReply, ChatRequest, LlmClient};
use crate::memory::{ActionRequest, Message};
use crate::tools::ToolDescriptor;

/// 一次模型调用的结论
#[derive(Debug, Clone, PartialEq)]
pub enum ModelDecision {
    Answer(String),
    Actions {
        content: String,
        actions: Vec<ActionRequest>,
    },
}

/// 文本形式的工具调用
#[derive(Debug, Deserialize)]
struct TextualCall {
    tool: String,
    #[serde(default)]
    args: Value,
}

pub fn new_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

/// 从文本中提取 ```json 块或首尾花括号之间的 JSON
fn extract_json(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

/// 只接受提供给模型的工具名，避免把回答里的普通 JSON 误认作调用
fn parse_textual_call(text: &str, tools: &[ToolDescriptor]) -> Option<ActionRequest> {
    let json = extract_json(text)?;
    let call: TextualCall = serde_json::from_str(json).ok()?;
    if call.tool.is_empty() || !tools.iter().any(|t| t.name == call.tool) {
        return None;
    }
    Some(ActionRequest {
        id: new_call_id(),
        name: call.tool,
        arguments: if call.args.is_null() {
            Value::Object(Default::default())
        } else {
            call.args
        },
    })
}

/// 解析后端应答；任何动作解析失败都整体降级为纯文本
pub fn parse_reply(reply: BackendReply, tools: &[ToolDescriptor]) -> ModelDecision {
    let content = reply.content.clone().unwrap_or_default();

    if !reply.tool_calls.is_empty() {
        let mut actions = Vec::with_capacity(reply.tool_calls.len());
        for call in &reply.tool_calls {
            let arguments = if call.arguments.trim().is_empty() {
                Ok(Value::Object(Default::default()))
            } else {
                serde_json::from_str::<Value>(&call.arguments)
            };
            match arguments {
                Ok(arguments) if !call.name.trim().is_empty() => actions.push(ActionRequest {
                    id: call.id.clone().unwrap_or_else(new_call_id),
                    name: call.name.trim().to_string(),
                    arguments,
                }),
                Ok(_) => {
                    tracing::warn!("tool call without a name, treating reply as text");
                    return degrade(content, &reply);
                }
                Err(e) => {
                    tracing::warn!(tool = %call.name, error = %e, "unparsable tool arguments, treating reply as text");
                    return degrade(content, &reply);
                }
            }
        }
        return ModelDecision::Actions { content, actions };
    }

    match parse_textual_call(&content, tools) {
        Some(action) => ModelDecision::Actions {
            content: String::new(),
            actions: vec![action],
        },
        None => ModelDecision::Answer(content.trim().to_string()),
    }
}

fn degrade(content: String, reply: &BackendReply) -> ModelDecision {
    if !content.trim().is_empty() {
        return ModelDecision::Answer(content.trim().to_string());
    }
    let raw = reply
        .tool_calls
        .iter()
        .map(|c| format!("{}({})", c.name, c.arguments))
        .collect::<Vec<_>>()
        .join("\n");
    ModelDecision::Answer(raw)
}

/// 模型网关：持有后端、重试策略与单次尝试超时
pub struct ModelGateway {
    client: Arc<dyn LlmClient>,
    retry: RetryPolicy,
    attempt_timeout: Duration,
}

impl ModelGateway {
    pub fn new(client: Arc<dyn LlmClient>, retry: RetryPolicy, attempt_timeout: Duration) -> Self {
        Self {
            client,
            retry,
            attempt_timeout,
        }
    }

    pub fn client(&self) -> &Arc<dyn LlmClient> {
        &self.client
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// 调用后端并解析；deadline 为整轮的外层期限，单次尝试超时会被裁剪到剩余时间
    pub async fn complete(
        &self,
        history: &[Message],
        tools: &[ToolDescriptor],
        deadline: Option<Instant>,
    ) -> Result<ModelDecision, AgentError> {
        let request = ChatRequest {
            messages: history.to_vec(),
            tools: tools.to_vec(),
        };

        let reply = self
            .retry
            .run("llm.complete", |attempt| {
                let request = &request;
                async move {
                    let limit = match deadline {
                        Some(deadline) => {
                            let remaining = deadline.saturating_duration_since(Instant::now());
                            if remaining.is_zero() {
                                return Err(AgentError::Timeout("turn deadline reached".to_string()));
                            }
                            remaining.min(self.attempt_timeout)
                        }
                        None => self.attempt_timeout,
                    };
                    tracing::debug!(backend = %self.client.name(), attempt, "calling model backend");
                    match tokio::time::timeout(limit, self.client.complete(request)).await {
                        Ok(result) => result.map_err(AgentError::from),
                        Err(_) => Err(AgentError::Timeout(format!(
                            "model backend did not answer within {}ms",
                            limit.as_millis()
                        ))),
                    }
                }
            })
            .await
            .map_err(|err| match err {
                // 重试耗尽后的超时按瞬时后端错误上报
                AgentError::Timeout(msg) => AgentError::TransientBackend(msg),
                other => other,
            })?;

        Ok(parse_reply(reply, tools))
    }
}
