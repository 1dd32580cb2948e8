//! OpenAI 兼容 API 客户端
//!
//! 直接以 reqwest 发送 `/chat/completions` 请求（可配置 base_url，兼容 DeepSeek、OpenAI、自建代理等）。
//! 工具描述映射为 `tools[].function`，工具结果映射为 `role=tool` + `tool_call_id`。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::AgentError;
use crate::llm::{BackendError, BackendReply, ChatRequest, LlmClient, RawToolCall};
use crate::memory::Message;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
}

#[derive(Serialize)]
struct WireMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunctionCall,
}

#[derive(Serialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Serialize)]
struct WireTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireToolFunction<'a>,
}

#[derive(Serialize)]
struct WireToolFunction<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a Value,
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireReplyMessage,
}

#[derive(Deserialize)]
struct WireReplyMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireReplyToolCall>,
}

#[derive(Deserialize)]
struct WireReplyToolCall {
    #[serde(default)]
    id: Option<String>,
    function: WireReplyFunction,
}

#[derive(Deserialize)]
struct WireReplyFunction {
    name: String,
    /// 规范为 JSON 字符串，部分兼容端点直接返回对象
    #[serde(default)]
    arguments: Value,
}

fn to_wire(message: &Message) -> WireMessage {
    match message {
        Message::System { content } => WireMessage {
            role: "system",
            content: Some(content.clone()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        },
        Message::User { content, .. } => WireMessage {
            role: "user",
            content: Some(content.clone()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        },
        Message::Assistant { content, actions } => WireMessage {
            role: "assistant",
            content: if content.is_empty() && !actions.is_empty() {
                None
            } else {
                Some(content.clone())
            },
            tool_calls: actions
                .iter()
                .map(|a| WireToolCall {
                    id: a.id.clone(),
                    kind: "function",
                    function: WireFunctionCall {
                        name: a.name.clone(),
                        arguments: a.arguments.to_string(),
                    },
                })
                .collect(),
            tool_call_id: None,
        },
        Message::Tool { result } => WireMessage {
            role: "tool",
            content: Some(result.content()),
            tool_calls: Vec::new(),
            tool_call_id: Some(result.call_id.clone()),
        },
    }
}

/// 408 / 409 / 429 / 5xx 可重试，其余 4xx 为永久失败
fn classify_status(status: StatusCode, body: &str) -> BackendError {
    let snippet: String = body.chars().take(300).collect();
    let msg = format!("HTTP {}: {}", status.as_u16(), snippet);
    if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_MANY_REQUESTS
        )
    {
        BackendError::Transient(msg)
    } else {
        BackendError::Permanent(msg)
    }
}

fn classify_transport(err: reqwest::Error) -> BackendError {
    if err.is_decode() || err.is_builder() {
        BackendError::Permanent(err.to_string())
    } else {
        BackendError::Transient(err.to_string())
    }
}

/// OpenAI 兼容客户端
pub struct OpenAiClient {
    client: Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl OpenAiClient {
    /// api_key 为空时读取 OPENAI_API_KEY
    pub fn new(
        base_url: Option<&str>,
        model: &str,
        api_key: Option<&str>,
        request_timeout: Duration,
    ) -> Result<Self, AgentError> {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_default();
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| AgentError::Config(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            model: model.to_string(),
            api_key,
        })
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.api_key.is_empty() {
            builder
        } else {
            builder.bearer_auth(&self.api_key)
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &ChatRequest) -> Result<BackendReply, BackendError> {
        let body = WireRequest {
            model: &self.model,
            messages: request.messages.iter().map(to_wire).collect(),
            tools: request
                .tools
                .iter()
                .map(|t| WireTool {
                    kind: "function",
                    function: WireToolFunction {
                        name: &t.name,
                        description: &t.description,
                        parameters: &t.parameters,
                    },
                })
                .collect(),
        };

        let response = self
            .authorized(self.client.post(format!("{}/chat/completions", self.base_url)))
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        let text = response.text().await.map_err(classify_transport)?;
        if !status.is_success() {
            return Err(classify_status(status, &text));
        }

        let parsed: WireResponse = serde_json::from_str(&text)
            .map_err(|e| BackendError::Permanent(format!("undecodable response: {e}")))?;
        let message = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| BackendError::Permanent("response has no choices".to_string()))?;

        Ok(BackendReply {
            content: message.content,
            tool_calls: message
                .tool_calls
                .into_iter()
                .map(|c| RawToolCall {
                    id: c.id.filter(|id| !id.is_empty()),
                    name: c.function.name,
                    arguments: match c.function.arguments {
                        Value::String(s) => s,
                        Value::Null => String::new(),
                        other => other.to_string(),
                    },
                })
                .collect(),
        })
    }

    async fn health_check(&self) -> Result<(), BackendError> {
        let response = self
            .authorized(self.client.get(format!("{}/models", self.base_url)))
            .send()
            .await
            .map_err(classify_transport)?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(classify_status(status, &text))
        }
    }
}
