//! Mock LLM 客户端（用于测试与本地运行，无需 API）
//!
//! - MockLlmClient：取最后一条 User 消息，以 echo 工具调用回显；收到工具结果后给出最终回答
//! - ScriptedLlmClient：按脚本依次返回应答 / 错误 / 卡住，记录调用次数与并发度

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::llm::{BackendError, BackendReply, ChatRequest, LlmClient, RawToolCall};
use crate::memory::Message;

/// 回显客户端：user → echo 工具调用；tool 结果 → 最终回答
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, request: &ChatRequest) -> Result<BackendReply, BackendError> {
        match request.messages.last() {
            Some(Message::Tool { result }) => {
                Ok(BackendReply::text(format!("Echo from Mock: {}", result.content())))
            }
            last => {
                let text = match last {
                    Some(Message::User { content, .. }) => content.clone(),
                    _ => "(no input)".to_string(),
                };
                if request.tools.iter().any(|t| t.name == "echo") {
                    Ok(BackendReply::calls(vec![RawToolCall {
                        id: None,
                        name: "echo".to_string(),
                        arguments: json!({ "text": text }).to_string(),
                    }]))
                } else {
                    Ok(BackendReply::text(format!("Echo from Mock: {text}")))
                }
            }
        }
    }
}

/// 脚本中的一步
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Reply(BackendReply),
    Fail(BackendError),
    /// 卡住给定时长后以瞬时错误返回（模拟后端超时）
    Stall(Duration),
}

/// 脚本化客户端：脚本耗尽后重复 fallback（未设置则返回永久错误）
pub struct ScriptedLlmClient {
    script: Mutex<VecDeque<ScriptStep>>,
    fallback: Option<ScriptStep>,
    delay: Duration,
    reachable: AtomicBool,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedLlmClient {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            script: Mutex::new(steps.into()),
            fallback: None,
            delay: Duration::ZERO,
            reachable: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// 永远返回同一应答（例如总是请求下一个动作）
    pub fn repeating(reply: BackendReply) -> Self {
        Self::new(Vec::new()).with_fallback(ScriptStep::Reply(reply))
    }

    pub fn with_fallback(mut self, step: ScriptStep) -> Self {
        self.fallback = Some(step);
        self
    }

    /// 每次调用前的固定延迟
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 同一时刻进行中的最大调用数
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// 收到过的全部请求
    pub fn requests(&self) -> Vec<ChatRequest> {
        match self.requests.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn next_step(&self) -> Option<ScriptStep> {
        let mut script = match self.script.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        script.pop_front().or_else(|| self.fallback.clone())
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &ChatRequest) -> Result<BackendReply, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match self.next_step() {
            Some(ScriptStep::Reply(reply)) => Ok(reply),
            Some(ScriptStep::Fail(err)) => Err(err),
            Some(ScriptStep::Stall(duration)) => {
                tokio::time::sleep(duration).await;
                Err(BackendError::Transient("stalled".to_string()))
            }
            None => Err(BackendError::Permanent("script exhausted".to_string())),
        }
    }

    async fn health_check(&self) -> Result<(), BackendError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::Transient("backend unreachable".to_string()))
        }
    }
}
